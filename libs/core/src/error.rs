use thiserror::Error;

use crate::connector::ConnectorError;

/// Failures surfaced by [`crate::TurnContext`] operations and the send pipeline.
#[derive(Debug, Error)]
pub enum TurnError {
    /// The turn finished and its context was released.
    #[error("turn context already released")]
    ContextRevoked,
    #[error("responded flag cannot be reset to false once a reply was sent")]
    RespondedReset,
    #[error("no connector client is attached to this turn")]
    MissingConnectorClient,
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("eTag conflict writing key `{key}`")]
    ETagConflict { key: String },
    #[error("storage key must not be empty")]
    EmptyKey,
    #[error("storage item could not be (de)serialized")]
    Serialization(#[from] serde_json::Error),
}
