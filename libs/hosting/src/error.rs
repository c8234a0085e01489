use agents_auth::AuthError;
use agents_core::{ConnectorError, TurnError};
use axum::Json;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid activity: {0}")]
    InvalidActivity(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error(transparent)]
    Turn(#[from] TurnError),
}

#[derive(Serialize, Debug)]
pub struct ApiError {
    pub error: String,
}

impl AdapterError {
    pub fn status(&self) -> StatusCode {
        match self {
            AdapterError::InvalidActivity(_) => StatusCode::BAD_REQUEST,
            AdapterError::Auth(err) => err.status(),
            AdapterError::Connector(_) | AdapterError::Turn(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AdapterError::InvalidActivity(_) => "invalid_activity",
            AdapterError::Auth(err) => err.kind(),
            AdapterError::Connector(_) => "connector",
            AdapterError::Turn(_) => "turn",
        }
    }
}

impl IntoResponse for AdapterError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error = if status.is_server_error() {
            self.kind().to_string()
        } else {
            self.to_string()
        };
        (status, Json(ApiError { error })).into_response()
    }
}
