//! Activity protocol, turn context and relay clients for hosted agents.
//!
//! The crate carries the pieces a host needs on every turn: the typed activity
//! model, the per-turn [`TurnContext`] with its hook chains and side table,
//! the middleware pipeline, the connector and user-token REST clients, and the
//! storage contract used by higher-level state.
pub mod activity;
pub mod adapter;
pub mod channel;
pub mod connector;
pub mod context;
pub mod error;
pub mod hooks;
pub mod identity;
pub mod middleware;
pub mod normalize;
pub mod reference;
pub mod storage;
pub mod turn_state;
pub mod user_token;

pub use activity::*;
pub use adapter::ChannelAdapter;
pub use channel::ConnectorChannel;
pub use connector::{
    ConnectorCall, ConnectorClient, ConnectorError, ConnectorOptions, ConversationParameters,
    ConversationResourceResponse, MockConnectorClient, RestConnectorClient,
};
pub use context::{RevocationGuard, TurnContext, TurnOutcome};
pub use error::{StorageError, TurnError};
pub use hooks::{
    DeleteActivityHook, DeleteNext, SendActivitiesHook, SendNext, UpdateActivityHook, UpdateNext,
};
pub use identity::ClaimsIdentity;
pub use middleware::{ActivityHandler, Middleware, MiddlewareSet, Next, handler_fn};
pub use normalize::{normalize_incoming, normalize_outgoing};
pub use reference::ConversationReference;
pub use storage::{MemoryStorage, Storage, StoreItem};
pub use turn_state::{TurnState, TurnStateKey, TurnStateValue};
pub use user_token::{RestUserTokenClient, UserTokenClient};
