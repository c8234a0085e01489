use async_trait::async_trait;

use crate::activity::{Activity, ResourceResponse};
use crate::context::TurnContext;
use crate::error::TurnError;
use crate::reference::ConversationReference;

/// Terminal step of the outbound hook chains: delivers activities to the channel.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Delivers `activities` sequentially, in order.
    async fn send_activities(
        &self,
        context: &TurnContext,
        activities: Vec<Activity>,
    ) -> Result<Vec<ResourceResponse>, TurnError>;

    async fn update_activity(
        &self,
        context: &TurnContext,
        activity: Activity,
    ) -> Result<ResourceResponse, TurnError>;

    async fn delete_activity(
        &self,
        context: &TurnContext,
        reference: ConversationReference,
    ) -> Result<(), TurnError>;
}
