use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info_span, Instrument};

use crate::activity::{Activity, ResourceResponse, activity_types, channels};
use crate::adapter::ChannelAdapter;
use crate::context::TurnContext;
use crate::error::TurnError;
use crate::reference::ConversationReference;
use crate::turn_state::TurnStateValue;

pub const DEFAULT_DELAY_MS: u64 = 1000;

/// Delivers outbound activities through the turn's connector client.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectorChannel;

impl ConnectorChannel {
    pub fn new() -> Self {
        Self
    }

    async fn send_one(
        &self,
        context: &TurnContext,
        activity: Activity,
    ) -> Result<ResourceResponse, TurnError> {
        if activity.is_type(activity_types::DELAY) {
            let millis = activity
                .value
                .as_ref()
                .and_then(|value| value.as_u64())
                .unwrap_or(DEFAULT_DELAY_MS);
            tokio::time::sleep(Duration::from_millis(millis)).await;
            return Ok(ResourceResponse::default());
        }

        if activity.is_type(activity_types::INVOKE_RESPONSE) {
            context.set_turn_state(TurnStateValue::InvokeResponse(activity))?;
            return Ok(ResourceResponse::default());
        }

        let is_emulator = activity
            .channel_id
            .as_deref()
            .map(|channel| channel.eq_ignore_ascii_case(channels::EMULATOR))
            .unwrap_or(false);
        if activity.is_type(activity_types::TRACE) && !is_emulator {
            debug!("dropping trace activity outside the emulator");
            return Ok(ResourceResponse::default());
        }

        let connector = context.connector_client()?;
        let conversation_id = activity.conversation_id().unwrap_or_default().to_string();
        let response = match activity.reply_to_id.as_deref() {
            Some(reply_to_id) => {
                connector
                    .reply_to_activity(&conversation_id, reply_to_id, &activity)
                    .await?
            }
            None => connector.send_to_conversation(&conversation_id, &activity).await?,
        };
        Ok(response)
    }
}

#[async_trait]
impl ChannelAdapter for ConnectorChannel {
    async fn send_activities(
        &self,
        context: &TurnContext,
        activities: Vec<Activity>,
    ) -> Result<Vec<ResourceResponse>, TurnError> {
        let span = info_span!("channel.send", count = activities.len());
        async move {
            let mut responses = Vec::with_capacity(activities.len());
            for activity in activities {
                responses.push(self.send_one(context, activity).await?);
            }
            Ok(responses)
        }
        .instrument(span)
        .await
    }

    async fn update_activity(
        &self,
        context: &TurnContext,
        activity: Activity,
    ) -> Result<ResourceResponse, TurnError> {
        let connector = context.connector_client()?;
        let conversation_id = activity.conversation_id().unwrap_or_default().to_string();
        let activity_id = activity.id.clone().unwrap_or_default();
        Ok(connector
            .update_activity(&conversation_id, &activity_id, &activity)
            .await?)
    }

    async fn delete_activity(
        &self,
        context: &TurnContext,
        reference: ConversationReference,
    ) -> Result<(), TurnError> {
        let connector = context.connector_client()?;
        let conversation_id = reference.conversation_id().unwrap_or_default();
        let activity_id = reference.activity_id.as_deref().unwrap_or_default();
        connector.delete_activity(conversation_id, activity_id).await?;
        Ok(())
    }
}
