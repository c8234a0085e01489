use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use agents_auth::AgentsConfig;
use agents_auth::config::DEFAULT_CONNECTION;
use anyhow::{Context, Result};

pub const DEFAULT_BIND: &str = "0.0.0.0:3978";

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub addr: SocketAddr,
    pub config_file: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bind = lookup("BIND")
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BIND.to_string());
        let addr = bind
            .trim()
            .parse()
            .with_context(|| format!("invalid BIND address `{bind}`"))?;
        let config_file = lookup("AGENTS_CONFIG_FILE")
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);
        Ok(Self { addr, config_file })
    }

    /// Agents configuration from the optional file with the process
    /// environment layered on top.
    pub fn agents_config(&self) -> Result<AgentsConfig> {
        AgentsConfig::load(self.config_file.as_deref(), env::vars())
            .context("failed to load agents configuration")
    }
}

/// Application id proactive turns act as: the default connection's client id,
/// else the only configured one. Empty when running without credentials.
pub fn agent_app_id(config: &AgentsConfig) -> String {
    config
        .connections
        .get(DEFAULT_CONNECTION)
        .or_else(|| config.connections.values().next())
        .map(|connection| connection.settings.client_id().to_string())
        .unwrap_or_default()
}
