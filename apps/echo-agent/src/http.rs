use std::sync::Arc;

use agents_core::Storage;
use agents_hosting::{ApiError, CloudAdapter};
use axum::{
    Router, debug_handler,
    extract::{Extension, Json},
    http::StatusCode,
    routing::post,
};
use serde::{Deserialize, Serialize};
use tracing::{Instrument, info_span, warn};

use crate::echo::{EchoAgent, NotifyHandler, load_reference};

pub const NOTIFY_PATH: &str = "/api/notify";

#[derive(Clone)]
pub struct NotifyState {
    pub adapter: Arc<CloudAdapter>,
    pub storage: Arc<dyn Storage>,
    pub app_id: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyRequest {
    pub conversation_id: String,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct NotifyResponse {
    status: String,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

/// `/api/messages` and `/healthz` from the hosting router plus the proactive
/// `/api/notify` endpoint.
pub fn build_router(adapter: Arc<CloudAdapter>, storage: Arc<dyn Storage>, app_id: String) -> Router {
    let agent = Arc::new(EchoAgent::new(storage.clone()));
    let state = Arc::new(NotifyState {
        adapter: adapter.clone(),
        storage,
        app_id,
    });
    agents_hosting::router(adapter, agent).merge(
        Router::new()
            .route(NOTIFY_PATH, post(notify))
            .layer(Extension(state)),
    )
}

fn api_error(status: StatusCode, error: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (
        status,
        Json(ApiError {
            error: error.into(),
        }),
    )
}

#[debug_handler]
async fn notify(
    Extension(state): Extension<Arc<NotifyState>>,
    Json(request): Json<NotifyRequest>,
) -> ApiResult<(StatusCode, Json<NotifyResponse>)> {
    let span = info_span!("notify", conversation = %request.conversation_id);
    async move {
        let reference = load_reference(state.storage.as_ref(), &request.conversation_id)
            .await
            .map_err(|err| {
                warn!(error = %err, "failed to read conversation reference");
                api_error(StatusCode::INTERNAL_SERVER_ERROR, "storage")
            })?
            .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "unknown conversation"))?;

        let handler = NotifyHandler::new(request.text);
        state
            .adapter
            .continue_conversation_as(&state.app_id, &reference, &handler)
            .await
            .map_err(|err| {
                warn!(error = %err, "proactive notification failed");
                let status = err.status();
                let message = if status.is_server_error() {
                    err.kind().to_string()
                } else {
                    err.to_string()
                };
                api_error(status, message)
            })?;

        Ok((
            StatusCode::ACCEPTED,
            Json(NotifyResponse {
                status: "sent".into(),
            }),
        ))
    }
    .instrument(span)
    .await
}
