use http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credential configuration: {0}")]
    InvalidConfiguration(String),
    #[error("no connection matches audience `{audience}` and service url `{service_url}`")]
    ConnectionNotFound {
        audience: String,
        service_url: String,
    },
    #[error("failed to acquire token: {0}")]
    TokenAcquisition(String),
    #[error("failed to acquire agentic application token for `{app_id}` (instance `{instance_id}`): {reason}")]
    AgenticApplicationToken {
        app_id: String,
        instance_id: String,
        reason: String,
    },
    #[error("failed to acquire agentic instance token for `{instance_id}`: {reason}")]
    AgenticInstanceToken { instance_id: String, reason: String },
    #[error("failed to acquire agentic user token for instance `{instance_id}`: {reason}")]
    AgenticUserToken { instance_id: String, reason: String },
    #[error("unauthorized: {reason}")]
    Unauthorized { reason: String },
    #[error("signing key discovery failed: {0}")]
    KeyDiscovery(String),
    #[error("token endpoint transport error")]
    Transport(#[source] reqwest::Error),
}

impl AuthError {
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        AuthError::Unauthorized {
            reason: reason.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short reason safe to return to callers and to use as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::InvalidConfiguration(_) => "invalid_configuration",
            AuthError::ConnectionNotFound { .. } => "connection_not_found",
            AuthError::TokenAcquisition(_) => "token_acquisition",
            AuthError::AgenticApplicationToken { .. } => "agentic_application_token",
            AuthError::AgenticInstanceToken { .. } => "agentic_instance_token",
            AuthError::AgenticUserToken { .. } => "agentic_user_token",
            AuthError::Unauthorized { .. } => "unauthorized",
            AuthError::KeyDiscovery(_) => "key_discovery",
            AuthError::Transport(_) => "transport",
        }
    }
}
