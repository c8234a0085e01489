use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::reference::ConversationReference;

pub mod activity_types {
    pub const MESSAGE: &str = "message";
    pub const EVENT: &str = "event";
    pub const INVOKE: &str = "invoke";
    pub const INVOKE_RESPONSE: &str = "invokeResponse";
    pub const TRACE: &str = "trace";
    pub const DELAY: &str = "delay";
    pub const TYPING: &str = "typing";
    pub const CONVERSATION_UPDATE: &str = "conversationUpdate";
    pub const END_OF_CONVERSATION: &str = "endOfConversation";
}

pub mod delivery_modes {
    pub const NORMAL: &str = "normal";
    pub const NOTIFICATION: &str = "notification";
    /// Replies are buffered and returned in the HTTP response body.
    pub const EXPECT_REPLIES: &str = "expectReplies";
    pub const STREAM: &str = "stream";
}

pub mod roles {
    pub const USER: &str = "user";
    pub const AGENT: &str = "bot";
    pub const SKILL: &str = "skill";
    pub const AGENTIC_INSTANCE: &str = "agenticAppInstance";
    pub const AGENTIC_USER: &str = "agenticUser";

    pub fn is_agentic(role: &str) -> bool {
        role.eq_ignore_ascii_case(AGENTIC_INSTANCE) || role.eq_ignore_ascii_case(AGENTIC_USER)
    }
}

pub mod channels {
    pub const MSTEAMS: &str = "msteams";
    pub const AGENTS: &str = "agents";
    pub const EMULATOR: &str = "emulator";
    pub const DIRECTLINE: &str = "directline";
    pub const WEBCHAT: &str = "webchat";
}

/// Protocol activity exchanged with the messaging relay.
///
/// Unknown fields survive a parse/serialize cycle through `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    #[serde(rename = "type", default)]
    pub r#type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<ConversationAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relates_to: Option<ConversationReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelAccount {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aad_object_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agentic_app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agentic_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agentic_app_blueprint_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

impl ChannelAccount {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn is_agentic(&self) -> bool {
        self.role.as_deref().map(roles::is_agentic).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationAccount {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_group: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

impl ConversationAccount {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceResponse {
    #[serde(default)]
    pub id: String,
}

/// Value stored for an invoke activity and mapped onto the HTTP response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvokeResponse {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl InvokeResponse {
    pub fn new(status: u16, body: Option<Value>) -> Self {
        Self { status, body }
    }

    /// Reads the response carried by an `invokeResponse` activity. A value that
    /// is not shaped like `{status, body}` becomes a 200 with the raw value as body.
    pub fn from_activity(activity: &Activity) -> Self {
        match activity.value.as_ref() {
            Some(value) => serde_json::from_value::<InvokeResponse>(value.clone())
                .unwrap_or_else(|_| InvokeResponse::new(200, Some(value.clone()))),
            None => InvokeResponse::new(200, None),
        }
    }
}

/// Envelope returned for buffered (`expectReplies`) turns.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExpectedReplies {
    pub activities: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActivityError {
    #[error("activity type is required")]
    MissingType,
    #[error("activity conversation id is required")]
    MissingConversationId,
    #[error("conversation reference service url is required")]
    MissingServiceUrl,
}

impl Activity {
    pub fn new(r#type: impl Into<String>) -> Self {
        Self {
            r#type: r#type.into(),
            ..Self::default()
        }
    }

    pub fn message(text: impl Into<String>) -> Self {
        let mut activity = Self::new(activity_types::MESSAGE);
        activity.text = Some(text.into());
        activity
    }

    pub fn trace(
        name: impl Into<String>,
        value: Option<Value>,
        value_type: Option<String>,
        label: Option<String>,
    ) -> Self {
        let mut activity = Self::new(activity_types::TRACE);
        activity.name = Some(name.into());
        activity.value = value;
        activity.value_type = value_type;
        activity.label = label;
        activity
    }

    pub fn invoke_response(response: InvokeResponse) -> Self {
        let mut activity = Self::new(activity_types::INVOKE_RESPONSE);
        activity.value = serde_json::to_value(response).ok();
        activity
    }

    pub fn is_type(&self, r#type: &str) -> bool {
        self.r#type.eq_ignore_ascii_case(r#type)
    }

    pub fn is_expect_replies(&self) -> bool {
        self.delivery_mode
            .as_deref()
            .map(|mode| mode.eq_ignore_ascii_case(delivery_modes::EXPECT_REPLIES))
            .unwrap_or(false)
    }

    pub fn is_invoke(&self) -> bool {
        self.is_type(activity_types::INVOKE) || self.is_type(activity_types::INVOKE_RESPONSE)
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation
            .as_ref()
            .map(|conversation| conversation.id.as_str())
            .filter(|id| !id.trim().is_empty())
    }

    /// Structural check applied to every inbound activity.
    pub fn validate(&self) -> Result<(), ActivityError> {
        if self.r#type.trim().is_empty() {
            return Err(ActivityError::MissingType);
        }
        if self.conversation_id().is_none() {
            return Err(ActivityError::MissingConversationId);
        }
        Ok(())
    }

    /// True when the agent is addressed through an agentic identity.
    pub fn is_agentic_request(&self) -> bool {
        self.recipient
            .as_ref()
            .map(ChannelAccount::is_agentic)
            .unwrap_or(false)
    }

    pub fn agentic_instance_id(&self) -> Option<&str> {
        self.recipient
            .as_ref()
            .filter(|recipient| recipient.is_agentic())
            .and_then(|recipient| recipient.agentic_app_id.as_deref())
    }

    pub fn agentic_user(&self) -> Option<&str> {
        self.recipient
            .as_ref()
            .filter(|recipient| recipient.is_agentic())
            .and_then(|recipient| recipient.agentic_user_id.as_deref())
    }

    pub fn agentic_tenant_id(&self) -> Option<&str> {
        self.recipient
            .as_ref()
            .and_then(|recipient| recipient.tenant_id.as_deref())
            .or_else(|| {
                self.conversation
                    .as_ref()
                    .and_then(|conversation| conversation.tenant_id.as_deref())
            })
    }

    pub fn conversation_reference(&self) -> ConversationReference {
        ConversationReference {
            activity_id: self.id.clone(),
            user: self.from.clone(),
            agent: self.recipient.clone(),
            conversation: self.conversation.clone(),
            channel_id: self.channel_id.clone(),
            locale: self.locale.clone(),
            service_url: self.service_url.clone(),
        }
    }

    /// Addresses this activity using a stored reference. Outgoing activities
    /// are sent by the agent to the user and reply to the referenced activity.
    pub fn apply_conversation_reference(
        &mut self,
        reference: &ConversationReference,
        is_incoming: bool,
    ) {
        self.channel_id = reference.channel_id.clone();
        self.service_url = reference.service_url.clone();
        self.conversation = reference.conversation.clone();
        if self.locale.is_none() {
            self.locale = reference.locale.clone();
        }
        if is_incoming {
            self.from = reference.user.clone();
            self.recipient = reference.agent.clone();
            if let Some(id) = &reference.activity_id {
                self.id = Some(id.clone());
            }
        } else {
            self.from = reference.agent.clone();
            self.recipient = reference.user.clone();
            if let Some(id) = &reference.activity_id
                && !self.is_type(activity_types::CONVERSATION_UPDATE)
                && self.reply_to_id.is_none()
            {
                self.reply_to_id = Some(id.clone());
            }
        }
    }

    /// Builds a message addressed back to the sender of this activity.
    pub fn reply(&self, text: impl Into<String>) -> Activity {
        let mut reply = Activity::message(text);
        reply.id = Some(Uuid::new_v4().to_string());
        reply.apply_conversation_reference(&self.conversation_reference(), false);
        reply
    }
}
