use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::StatusCode;
use metrics::{counter, histogram};
use reqwest::header::USER_AGENT as USER_AGENT_HEADER;
use reqwest::{Client, Method, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::activity::{Activity, ChannelAccount, ResourceResponse, channels};
use crate::normalize::normalize_outgoing;

/// Product identifier carried on every relay request.
pub const USER_AGENT: &str = concat!("agents-hosting-rust/", env!("CARGO_PKG_VERSION"));

pub const DEFAULT_MAX_CONVERSATION_ID_LENGTH: usize = 150;

/// Channels whose transports limit URL length for agentic conversation ids.
const TRUNCATED_CHANNELS: &[&str] = &[channels::MSTEAMS, channels::AGENTS];

const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectorOptions {
    pub max_conversation_id_length: usize,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            max_conversation_id_length: DEFAULT_MAX_CONVERSATION_ID_LENGTH,
        }
    }
}

impl ConnectorOptions {
    /// Builds options from a raw setting. Anything that is not a positive
    /// integer falls back to the default.
    pub fn from_setting(raw: Option<&str>) -> Self {
        Self {
            max_conversation_id_length: parse_max_conversation_id_length(raw),
        }
    }
}

pub fn parse_max_conversation_id_length(raw: Option<&str>) -> usize {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return DEFAULT_MAX_CONVERSATION_ID_LENGTH;
    };
    match raw.parse::<usize>() {
        Ok(value) if value > 0 => value,
        _ => {
            warn!(
                value = raw,
                fallback = DEFAULT_MAX_CONVERSATION_ID_LENGTH,
                "invalid max conversation id length; using default"
            );
            DEFAULT_MAX_CONVERSATION_ID_LENGTH
        }
    }
}

/// True when the outgoing activity targets a length-limited channel on behalf
/// of an agentic identity.
pub fn requires_conversation_id_truncation(activity: &Activity) -> bool {
    let channel_matches = activity
        .channel_id
        .as_deref()
        .map(|channel| {
            TRUNCATED_CHANNELS
                .iter()
                .any(|candidate| candidate.eq_ignore_ascii_case(channel))
        })
        .unwrap_or(false);
    let agentic = [activity.from.as_ref(), activity.recipient.as_ref()]
        .into_iter()
        .flatten()
        .any(ChannelAccount::is_agentic);
    channel_matches && agentic
}

pub fn truncate_conversation_id(conversation_id: &str, max_len: usize) -> String {
    conversation_id.chars().take(max_len).collect()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_group: Option<bool>,
    #[serde(rename = "bot", default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<Activity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationResourceResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<String>,
}

/// Attachment upload payload; binary content travels base64 encoded.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentData {
    #[serde(rename = "type")]
    pub content_type: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_base64: Option<String>,
}

impl AttachmentData {
    pub fn from_bytes(content_type: impl Into<String>, name: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            content_type: content_type.into(),
            name: name.into(),
            original_base64: Some(STANDARD.encode(bytes)),
            thumbnail_base64: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentView {
    pub view_id: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentInfo {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub content_type: String,
    #[serde(default)]
    pub views: Vec<AttachmentView>,
}

/// Conversation and activity operations of the messaging relay.
#[async_trait]
pub trait ConnectorClient: Send + Sync {
    async fn create_conversation(
        &self,
        parameters: &ConversationParameters,
    ) -> Result<ConversationResourceResponse, ConnectorError>;

    async fn send_to_conversation(
        &self,
        conversation_id: &str,
        activity: &Activity,
    ) -> Result<ResourceResponse, ConnectorError>;

    async fn reply_to_activity(
        &self,
        conversation_id: &str,
        activity_id: &str,
        activity: &Activity,
    ) -> Result<ResourceResponse, ConnectorError>;

    async fn update_activity(
        &self,
        conversation_id: &str,
        activity_id: &str,
        activity: &Activity,
    ) -> Result<ResourceResponse, ConnectorError>;

    async fn delete_activity(
        &self,
        conversation_id: &str,
        activity_id: &str,
    ) -> Result<(), ConnectorError>;

    async fn get_conversation_members(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ChannelAccount>, ConnectorError>;

    async fn upload_attachment(
        &self,
        conversation_id: &str,
        attachment: &AttachmentData,
    ) -> Result<ResourceResponse, ConnectorError>;

    async fn get_attachment_info(&self, attachment_id: &str)
    -> Result<AttachmentInfo, ConnectorError>;
}

/// Parses `url` keeping its last path segment, so relative joins land beneath it.
pub(crate) fn base_url_with_slash(url: &str) -> Result<Url, ConnectorError> {
    Url::parse(&format!("{}/", url.trim_end_matches('/')))
        .map_err(|err| ConnectorError::Config(err.into()))
}

pub struct RestConnectorClient {
    client: Client,
    base_url: Url,
    token: Option<String>,
    options: ConnectorOptions,
}

impl RestConnectorClient {
    /// `token` is `None` for anonymous development traffic.
    pub fn new(client: Client, service_url: &str, token: Option<String>) -> Result<Self, ConnectorError> {
        let base_url = base_url_with_slash(service_url)?;
        Ok(Self {
            client,
            base_url,
            token,
            options: ConnectorOptions::default(),
        })
    }

    pub fn with_options(mut self, options: ConnectorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, ConnectorError> {
        self.base_url
            .join(path)
            .map_err(|err| ConnectorError::Config(err.into()))
    }

    fn conversation_path(&self, conversation_id: &str, activity: Option<&Activity>) -> String {
        let conversation_id = match activity {
            Some(activity) if requires_conversation_id_truncation(activity) => {
                truncate_conversation_id(conversation_id, self.options.max_conversation_id_length)
            }
            _ => conversation_id.to_string(),
        };
        format!(
            "v3/conversations/{}",
            urlencoding::encode(&conversation_id)
        )
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header(USER_AGENT_HEADER, USER_AGENT);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn execute<T>(
        &self,
        operation: &'static str,
        builder: RequestBuilder,
    ) -> Result<T, ConnectorError>
    where
        T: DeserializeOwned + Default,
    {
        let started = Instant::now();
        let response = builder.send().await.map_err(|err| {
            counter!(
                "agents_connector_errors_total",
                "kind" => "transport",
                "operation" => operation
            )
            .increment(1);
            ConnectorError::Transport(err)
        })?;

        let status_label = response.status().as_str().to_string();
        histogram!(
            "agents_connector_roundtrip_seconds",
            "operation" => operation,
            "status" => status_label.clone()
        )
        .record(started.elapsed().as_secs_f64());
        counter!(
            "agents_connector_requests_total",
            "operation" => operation,
            "status" => status_label
        )
        .increment(1);

        map_response(operation, response).await
    }

    fn json_body(activity: &Activity) -> Result<Value, ConnectorError> {
        serde_json::to_value(activity)
            .map(normalize_outgoing)
            .map_err(|err| ConnectorError::Decode(err.into()))
    }
}

#[async_trait]
impl ConnectorClient for RestConnectorClient {
    async fn create_conversation(
        &self,
        parameters: &ConversationParameters,
    ) -> Result<ConversationResourceResponse, ConnectorError> {
        let url = self.endpoint("v3/conversations")?;
        let mut body =
            serde_json::to_value(parameters).map_err(|err| ConnectorError::Decode(err.into()))?;
        if let Some(activity) = body.get_mut("activity") {
            *activity = normalize_outgoing(activity.take());
        }
        self.execute("conversations.create", self.request(Method::POST, url).json(&body))
            .await
    }

    async fn send_to_conversation(
        &self,
        conversation_id: &str,
        activity: &Activity,
    ) -> Result<ResourceResponse, ConnectorError> {
        let path = format!(
            "{}/activities",
            self.conversation_path(conversation_id, Some(activity))
        );
        let url = self.endpoint(&path)?;
        debug!(activity_type = %activity.r#type, "sending activity to conversation");
        let body = Self::json_body(activity)?;
        self.execute("activities.send", self.request(Method::POST, url).json(&body))
            .await
    }

    async fn reply_to_activity(
        &self,
        conversation_id: &str,
        activity_id: &str,
        activity: &Activity,
    ) -> Result<ResourceResponse, ConnectorError> {
        let path = format!(
            "{}/activities/{}",
            self.conversation_path(conversation_id, Some(activity)),
            urlencoding::encode(activity_id)
        );
        let url = self.endpoint(&path)?;
        debug!(activity_type = %activity.r#type, "replying to activity");
        let body = Self::json_body(activity)?;
        self.execute("activities.reply", self.request(Method::POST, url).json(&body))
            .await
    }

    async fn update_activity(
        &self,
        conversation_id: &str,
        activity_id: &str,
        activity: &Activity,
    ) -> Result<ResourceResponse, ConnectorError> {
        let path = format!(
            "{}/activities/{}",
            self.conversation_path(conversation_id, Some(activity)),
            urlencoding::encode(activity_id)
        );
        let url = self.endpoint(&path)?;
        let body = Self::json_body(activity)?;
        self.execute("activities.update", self.request(Method::PUT, url).json(&body))
            .await
    }

    async fn delete_activity(
        &self,
        conversation_id: &str,
        activity_id: &str,
    ) -> Result<(), ConnectorError> {
        let path = format!(
            "{}/activities/{}",
            self.conversation_path(conversation_id, None),
            urlencoding::encode(activity_id)
        );
        let url = self.endpoint(&path)?;
        self.execute::<Value>("activities.delete", self.request(Method::DELETE, url))
            .await
            .map(|_| ())
    }

    async fn get_conversation_members(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ChannelAccount>, ConnectorError> {
        let path = format!("{}/members", self.conversation_path(conversation_id, None));
        let url = self.endpoint(&path)?;
        self.execute("conversations.members", self.request(Method::GET, url))
            .await
    }

    async fn upload_attachment(
        &self,
        conversation_id: &str,
        attachment: &AttachmentData,
    ) -> Result<ResourceResponse, ConnectorError> {
        let path = format!("{}/attachments", self.conversation_path(conversation_id, None));
        let url = self.endpoint(&path)?;
        self.execute(
            "attachments.upload",
            self.request(Method::POST, url).json(attachment),
        )
        .await
    }

    async fn get_attachment_info(
        &self,
        attachment_id: &str,
    ) -> Result<AttachmentInfo, ConnectorError> {
        let path = format!("v3/attachments/{}", urlencoding::encode(attachment_id));
        let url = self.endpoint(&path)?;
        self.execute("attachments.info", self.request(Method::GET, url))
            .await
    }
}

async fn map_response<T>(
    operation: &'static str,
    response: reqwest::Response,
) -> Result<T, ConnectorError>
where
    T: DeserializeOwned + Default,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable>".into());
        counter!(
            "agents_connector_errors_total",
            "kind" => "remote",
            "operation" => operation,
            "status" => status.as_str().to_string()
        )
        .increment(1);
        return Err(ConnectorError::Remote {
            status,
            message: body.chars().take(MAX_ERROR_BODY).collect(),
        });
    }

    let bytes = response.bytes().await.map_err(ConnectorError::Transport)?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice::<T>(&bytes).map_err(|err| {
        counter!(
            "agents_connector_errors_total",
            "kind" => "decode",
            "operation" => operation
        )
        .increment(1);
        ConnectorError::Decode(err.into())
    })
}

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("connector configuration error")]
    Config(anyhow::Error),
    #[error("connector transport error")]
    Transport(#[source] reqwest::Error),
    #[error("connector remote error (status {status}): {message}")]
    Remote { status: StatusCode, message: String },
    #[error("connector payload decode error")]
    Decode(anyhow::Error),
}

/// One recorded call against [`MockConnectorClient`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorCall {
    CreateConversation(ConversationParameters),
    SendToConversation {
        conversation_id: String,
        activity: Activity,
    },
    ReplyToActivity {
        conversation_id: String,
        activity_id: String,
        activity: Activity,
    },
    UpdateActivity {
        conversation_id: String,
        activity_id: String,
        activity: Activity,
    },
    DeleteActivity {
        conversation_id: String,
        activity_id: String,
    },
    GetConversationMembers {
        conversation_id: String,
    },
    UploadAttachment {
        conversation_id: String,
        attachment: AttachmentData,
    },
    GetAttachmentInfo {
        attachment_id: String,
    },
}

/// In-memory connector that records every call and answers with sequential ids.
#[derive(Default)]
pub struct MockConnectorClient {
    pub calls: Mutex<Vec<ConnectorCall>>,
    pub members: Vec<ChannelAccount>,
    next_id: AtomicUsize,
}

impl MockConnectorClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn recorded(&self) -> Vec<ConnectorCall> {
        self.calls.lock().await.clone()
    }

    async fn record(&self, call: ConnectorCall) -> ResourceResponse {
        self.calls.lock().await.push(call);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        ResourceResponse {
            id: format!("activity-{id}"),
        }
    }
}

#[async_trait]
impl ConnectorClient for MockConnectorClient {
    async fn create_conversation(
        &self,
        parameters: &ConversationParameters,
    ) -> Result<ConversationResourceResponse, ConnectorError> {
        let response = self
            .record(ConnectorCall::CreateConversation(parameters.clone()))
            .await;
        Ok(ConversationResourceResponse {
            id: format!("conversation-{}", response.id),
            service_url: None,
            activity_id: Some(response.id),
        })
    }

    async fn send_to_conversation(
        &self,
        conversation_id: &str,
        activity: &Activity,
    ) -> Result<ResourceResponse, ConnectorError> {
        Ok(self
            .record(ConnectorCall::SendToConversation {
                conversation_id: conversation_id.to_string(),
                activity: activity.clone(),
            })
            .await)
    }

    async fn reply_to_activity(
        &self,
        conversation_id: &str,
        activity_id: &str,
        activity: &Activity,
    ) -> Result<ResourceResponse, ConnectorError> {
        Ok(self
            .record(ConnectorCall::ReplyToActivity {
                conversation_id: conversation_id.to_string(),
                activity_id: activity_id.to_string(),
                activity: activity.clone(),
            })
            .await)
    }

    async fn update_activity(
        &self,
        conversation_id: &str,
        activity_id: &str,
        activity: &Activity,
    ) -> Result<ResourceResponse, ConnectorError> {
        self.record(ConnectorCall::UpdateActivity {
            conversation_id: conversation_id.to_string(),
            activity_id: activity_id.to_string(),
            activity: activity.clone(),
        })
        .await;
        Ok(ResourceResponse {
            id: activity_id.to_string(),
        })
    }

    async fn delete_activity(
        &self,
        conversation_id: &str,
        activity_id: &str,
    ) -> Result<(), ConnectorError> {
        self.record(ConnectorCall::DeleteActivity {
            conversation_id: conversation_id.to_string(),
            activity_id: activity_id.to_string(),
        })
        .await;
        Ok(())
    }

    async fn get_conversation_members(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ChannelAccount>, ConnectorError> {
        self.record(ConnectorCall::GetConversationMembers {
            conversation_id: conversation_id.to_string(),
        })
        .await;
        Ok(self.members.clone())
    }

    async fn upload_attachment(
        &self,
        conversation_id: &str,
        attachment: &AttachmentData,
    ) -> Result<ResourceResponse, ConnectorError> {
        Ok(self
            .record(ConnectorCall::UploadAttachment {
                conversation_id: conversation_id.to_string(),
                attachment: attachment.clone(),
            })
            .await)
    }

    async fn get_attachment_info(
        &self,
        attachment_id: &str,
    ) -> Result<AttachmentInfo, ConnectorError> {
        self.record(ConnectorCall::GetAttachmentInfo {
            attachment_id: attachment_id.to_string(),
        })
        .await;
        Ok(AttachmentInfo {
            name: attachment_id.to_string(),
            ..AttachmentInfo::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ChannelAccount, roles};
    use tracing_test::traced_test;

    fn outgoing(channel: &str, role: &str) -> Activity {
        let mut activity = Activity::message("hi");
        activity.channel_id = Some(channel.into());
        activity.from = Some(ChannelAccount::new("agent").with_role(role));
        activity.recipient = Some(ChannelAccount::new("user").with_role(roles::USER));
        activity
    }

    #[test]
    fn truncation_requires_channel_and_agentic_role() {
        assert!(requires_conversation_id_truncation(&outgoing("msteams", roles::AGENTIC_USER)));
        assert!(requires_conversation_id_truncation(&outgoing("agents", roles::AGENTIC_INSTANCE)));
        assert!(!requires_conversation_id_truncation(&outgoing("msteams", roles::AGENT)));
        assert!(!requires_conversation_id_truncation(&outgoing("webchat", roles::AGENTIC_USER)));
    }

    #[traced_test]
    #[test]
    fn invalid_length_setting_falls_back_with_warning() {
        assert_eq!(parse_max_conversation_id_length(Some("325")), 325);
        assert_eq!(parse_max_conversation_id_length(None), DEFAULT_MAX_CONVERSATION_ID_LENGTH);
        assert_eq!(
            parse_max_conversation_id_length(Some("lots")),
            DEFAULT_MAX_CONVERSATION_ID_LENGTH
        );
        assert_eq!(parse_max_conversation_id_length(Some("0")), DEFAULT_MAX_CONVERSATION_ID_LENGTH);
        assert!(logs_contain("invalid max conversation id length"));
    }

    #[test]
    fn truncate_counts_characters() {
        let id = "é".repeat(200);
        assert_eq!(truncate_conversation_id(&id, 150).chars().count(), 150);
        assert_eq!(truncate_conversation_id("short", 150), "short");
    }

    #[test]
    fn service_url_gains_trailing_slash() {
        let client = RestConnectorClient::new(Client::new(), "https://smba.example.net/amer", None)
            .expect("client");
        assert_eq!(client.base_url().as_str(), "https://smba.example.net/amer/");
        let client = RestConnectorClient::new(Client::new(), "https://smba.example.net/amer/", None)
            .expect("client");
        assert_eq!(client.base_url().as_str(), "https://smba.example.net/amer/");
        let client = RestConnectorClient::new(Client::new(), "https://smba.example.net", None)
            .expect("client");
        assert_eq!(client.base_url().as_str(), "https://smba.example.net/");
    }

    #[test]
    fn attachment_bytes_are_base64_encoded() {
        let data = AttachmentData::from_bytes("image/png", "dot.png", b"\x89PNG");
        assert_eq!(data.original_base64.as_deref(), Some("iVBORw=="));
        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(value["type"], "image/png");
        assert_eq!(value["originalBase64"], "iVBORw==");
    }
}
