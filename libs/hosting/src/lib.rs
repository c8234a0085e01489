//! HTTP hosting for agents: the cloud adapter that runs relay turns, the
//! per-turn client factory and an axum router exposing `/api/messages`.
pub mod adapter;
pub mod error;
pub mod factory;
pub mod http;
pub mod turn_error;

pub use adapter::{CloudAdapter, InboundRequest, TurnResponse};
pub use error::{AdapterError, ApiError};
pub use factory::{ConnectorFactory, MockConnectorFactory, RestConnectorFactory};
pub use http::{AgentState, router};
pub use turn_error::{DefaultTurnErrorHandler, TurnErrorHandler};
