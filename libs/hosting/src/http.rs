use std::sync::Arc;

use agents_core::ActivityHandler;
use axum::{
    Router, debug_handler,
    body::Bytes,
    extract::Extension,
    http::{HeaderMap, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use metrics::counter;

use crate::adapter::{CloudAdapter, InboundRequest};

pub const MESSAGES_PATH: &str = "/api/messages";
pub const HEALTH_PATH: &str = "/healthz";

#[derive(Clone)]
pub struct AgentState {
    pub adapter: Arc<CloudAdapter>,
    pub handler: Arc<dyn ActivityHandler>,
}

/// Routes for the relay messaging endpoint plus a liveness probe. Callers
/// merge their own routes onto the result.
pub fn router(adapter: Arc<CloudAdapter>, handler: Arc<dyn ActivityHandler>) -> Router {
    let state = Arc::new(AgentState { adapter, handler });
    Router::new()
        .route(MESSAGES_PATH, post(messages))
        .route(HEALTH_PATH, get(healthz))
        .layer(Extension(state))
}

#[debug_handler]
async fn messages(
    Extension(state): Extension<Arc<AgentState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let request = InboundRequest::new(authorization, body.to_vec());
    match state.adapter.process(request, state.handler.as_ref()).await {
        Ok(response) => {
            counter!("agents_requests_total", "status" => response.status.as_u16().to_string())
                .increment(1);
            response.into_response()
        }
        Err(err) => {
            counter!("agents_requests_total", "status" => err.status().as_u16().to_string())
                .increment(1);
            err.into_response()
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}
