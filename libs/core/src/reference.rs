use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::activity::{Activity, ActivityError, ChannelAccount, ConversationAccount, activity_types};

pub const CONTINUE_CONVERSATION_EVENT: &str = "ContinueConversation";
pub const CREATE_CONVERSATION_EVENT: &str = "CreateConversation";

/// Everything needed to address a conversation outside of an inbound request.
///
/// The agent side is called `agent` here; on the wire it is `bot`
/// (see [`crate::normalize`]).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<ConversationAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,
}

impl ConversationReference {
    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation
            .as_ref()
            .map(|conversation| conversation.id.as_str())
            .filter(|id| !id.trim().is_empty())
    }

    pub fn service_url(&self) -> Option<&str> {
        self.service_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
    }

    /// A reference is usable only with both a service url and a conversation id.
    pub fn validate(&self) -> Result<(), ActivityError> {
        if self.service_url().is_none() {
            return Err(ActivityError::MissingServiceUrl);
        }
        if self.conversation_id().is_none() {
            return Err(ActivityError::MissingConversationId);
        }
        Ok(())
    }

    /// Synthetic event that starts a proactive turn for this conversation.
    pub fn continuation_activity(&self) -> Activity {
        self.event_activity(CONTINUE_CONVERSATION_EVENT)
    }

    pub(crate) fn event_activity(&self, name: &str) -> Activity {
        let mut activity = Activity::new(activity_types::EVENT);
        activity.name = Some(name.to_string());
        activity.id = Some(Uuid::new_v4().to_string());
        activity.channel_id = self.channel_id.clone();
        activity.service_url = self.service_url.clone();
        activity.conversation = self.conversation.clone();
        activity.from = self.user.clone();
        activity.recipient = self.agent.clone();
        activity.locale = self.locale.clone();
        activity.relates_to = Some(self.clone());
        activity
    }

    pub fn creation_activity(&self) -> Activity {
        self.event_activity(CREATE_CONVERSATION_EVENT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> ConversationReference {
        ConversationReference {
            activity_id: Some("act-9".into()),
            user: Some(ChannelAccount::new("user-1")),
            agent: Some(ChannelAccount::new("agent-1")),
            conversation: Some(ConversationAccount::new("conv-1")),
            channel_id: Some("msteams".into()),
            locale: Some("en-US".into()),
            service_url: Some("https://smba.example.net/".into()),
        }
    }

    #[test]
    fn validate_rejects_missing_service_url_or_conversation() {
        assert!(reference().validate().is_ok());

        let mut missing_url = reference();
        missing_url.service_url = Some(String::new());
        assert_eq!(missing_url.validate(), Err(ActivityError::MissingServiceUrl));

        let mut missing_conversation = reference();
        missing_conversation.conversation = None;
        assert_eq!(
            missing_conversation.validate(),
            Err(ActivityError::MissingConversationId)
        );
    }

    #[test]
    fn continuation_activity_looks_like_inbound_traffic() {
        let activity = reference().continuation_activity();
        assert_eq!(activity.r#type, activity_types::EVENT);
        assert_eq!(activity.name.as_deref(), Some(CONTINUE_CONVERSATION_EVENT));
        assert_eq!(activity.from.as_ref().unwrap().id, "user-1");
        assert_eq!(activity.recipient.as_ref().unwrap().id, "agent-1");
        assert_eq!(activity.conversation_id(), Some("conv-1"));
        assert_eq!(activity.relates_to, Some(reference()));
        assert!(activity.validate().is_ok());
    }
}
