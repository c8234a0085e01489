use std::collections::HashMap;
use std::sync::Arc;

use agents_core::activity::activity_types;
use agents_core::reference::CONTINUE_CONVERSATION_EVENT;
use agents_core::{
    Activity, ActivityHandler, ConversationReference, Storage, StoreItem, TurnContext,
};
use anyhow::Context as _;
use async_trait::async_trait;
use tracing::debug;

pub fn reference_key(conversation_id: &str) -> String {
    format!("references/{conversation_id}")
}

/// Replies `Echo: <text>` to every message and remembers where it came from.
pub struct EchoAgent {
    storage: Arc<dyn Storage>,
}

impl EchoAgent {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    async fn remember(&self, activity: &Activity) -> anyhow::Result<()> {
        let reference = activity.conversation_reference();
        // Buffered turns may carry no service url; nothing to continue later.
        if reference.validate().is_err() {
            return Ok(());
        }
        let Some(conversation_id) = reference.conversation_id() else {
            return Ok(());
        };
        let item = StoreItem::from_serializable(&reference)?;
        let changes = HashMap::from([(reference_key(conversation_id), item)]);
        self.storage
            .write(changes)
            .await
            .context("failed to store conversation reference")
    }
}

#[async_trait]
impl ActivityHandler for EchoAgent {
    async fn on_turn(&self, context: &TurnContext) -> anyhow::Result<()> {
        let activity = context.activity()?;
        if !activity.is_type(activity_types::MESSAGE) {
            debug!(activity_type = %activity.r#type, "ignoring non-message activity");
            return Ok(());
        }
        self.remember(activity).await?;
        let text = activity.text.as_deref().unwrap_or_default().trim();
        context.send_text(format!("Echo: {text}")).await?;
        Ok(())
    }
}

/// Sends one message into a resumed conversation.
pub struct NotifyHandler {
    text: String,
}

impl NotifyHandler {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[async_trait]
impl ActivityHandler for NotifyHandler {
    async fn on_turn(&self, context: &TurnContext) -> anyhow::Result<()> {
        let activity = context.activity()?;
        if activity.name.as_deref() != Some(CONTINUE_CONVERSATION_EVENT) {
            return Ok(());
        }
        context.send_text(self.text.clone()).await?;
        Ok(())
    }
}

pub async fn load_reference(
    storage: &dyn Storage,
    conversation_id: &str,
) -> anyhow::Result<Option<ConversationReference>> {
    let key = reference_key(conversation_id);
    let mut items = storage.read(std::slice::from_ref(&key)).await?;
    items
        .remove(&key)
        .map(|item| item.deserialize::<ConversationReference>())
        .transpose()
        .context("stored conversation reference is unreadable")
}
