//! Sample agent host: echoes every message back and lets operators push
//! proactive notifications into conversations it has seen.
pub mod config;
pub mod echo;
pub mod http;

use std::sync::Arc;

use agents_core::{MemoryStorage, Storage};
use agents_hosting::CloudAdapter;
use anyhow::Result;
use axum::Router;
use tracing::info;

use crate::config::{AppConfig, agent_app_id};

/// Loads configuration and wires the production adapter.
pub fn build_app(config: &AppConfig) -> Result<Router> {
    let agents = config.agents_config()?;
    let app_id = agent_app_id(&agents);
    if app_id.is_empty() {
        info!("no connections configured; running without credentials");
    }
    let adapter = Arc::new(CloudAdapter::from_config(&agents)?);
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    Ok(http::build_router(adapter, storage, app_id))
}
