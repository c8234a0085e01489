use agents_core::TurnContext;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, warn};

pub const TURN_ERROR_TRACE_NAME: &str = "OnTurnError Trace";
pub const TURN_ERROR_VALUE_TYPE: &str = "https://www.botframework.com/schemas/error";
pub const TURN_ERROR_MESSAGE: &str = "The agent encountered an error or bug.";

/// Invoked once when the middleware pipeline or handler fails. Runs before
/// the turn context is released, so it can still send.
#[async_trait]
pub trait TurnErrorHandler: Send + Sync {
    async fn on_turn_error(&self, context: &TurnContext, error: &anyhow::Error);
}

/// Logs the failure, then sends a diagnostic trace and an apology. Both sends
/// are best effort.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTurnErrorHandler;

#[async_trait]
impl TurnErrorHandler for DefaultTurnErrorHandler {
    async fn on_turn_error(&self, context: &TurnContext, failure: &anyhow::Error) {
        error!(error = %failure, "unhandled error during turn");
        let trace = context
            .send_trace_activity(
                TURN_ERROR_TRACE_NAME,
                Some(Value::String(format!("{failure:#}"))),
                Some(TURN_ERROR_VALUE_TYPE.to_string()),
                Some("TurnError".to_string()),
            )
            .await;
        if let Err(err) = trace {
            warn!(error = %err, "failed to send turn error trace");
        }
        if let Err(err) = context.send_text(TURN_ERROR_MESSAGE).await {
            warn!(error = %err, "failed to send turn error message");
        }
    }
}
