use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::StatusCode;
use metrics::counter;
use reqwest::header::USER_AGENT as USER_AGENT_HEADER;
use reqwest::{Client, Method, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::connector::{ConnectorError, USER_AGENT, base_url_with_slash};
use crate::normalize::normalize_outgoing;
use crate::reference::ConversationReference;

pub const DEFAULT_TOKEN_SERVICE_URL: &str = "https://api.botframework.com/";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub connection_name: String,
    #[serde(default)]
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenExchangeResource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenPostResource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sas_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignInResource {
    #[serde(default)]
    pub sign_in_link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_exchange_resource: Option<TokenExchangeResource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_post_resource: Option<TokenPostResource>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenExchangeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub connection_name: String,
    #[serde(default)]
    pub has_token: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_provider_display_name: Option<String>,
}

/// User-scoped OAuth tokens held by the relay's token service.
#[async_trait]
pub trait UserTokenClient: Send + Sync {
    /// `Ok(None)` when the user has not signed in to the connection.
    async fn get_user_token(
        &self,
        user_id: &str,
        connection_name: &str,
        channel_id: &str,
        magic_code: Option<&str>,
    ) -> Result<Option<TokenResponse>, ConnectorError>;

    async fn sign_out(
        &self,
        user_id: &str,
        connection_name: &str,
        channel_id: &str,
    ) -> Result<(), ConnectorError>;

    async fn get_sign_in_resource(
        &self,
        connection_name: &str,
        reference: &ConversationReference,
        final_redirect: Option<&str>,
    ) -> Result<SignInResource, ConnectorError>;

    async fn exchange_token(
        &self,
        user_id: &str,
        connection_name: &str,
        channel_id: &str,
        request: &TokenExchangeRequest,
    ) -> Result<Option<TokenResponse>, ConnectorError>;

    async fn get_token_status(
        &self,
        user_id: &str,
        channel_id: &str,
        include_filter: Option<&str>,
    ) -> Result<Vec<TokenStatus>, ConnectorError>;
}

pub struct RestUserTokenClient {
    client: Client,
    base_url: Url,
    app_id: String,
    token: Option<String>,
}

impl RestUserTokenClient {
    pub fn new(
        client: Client,
        base_url: &str,
        app_id: impl Into<String>,
        token: Option<String>,
    ) -> Result<Self, ConnectorError> {
        Ok(Self {
            client,
            base_url: base_url_with_slash(base_url)?,
            app_id: app_id.into(),
            token,
        })
    }

    fn endpoint(&self, path: &str, query: &[(&str, &str)]) -> Result<Url, ConnectorError> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|err| ConnectorError::Config(err.into()))?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in query {
                pairs.append_pair(name, value);
            }
        }
        Ok(url)
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

    /// Encodes the state blob the token service hands back after sign-in.
    fn sign_in_state(&self, connection_name: &str, reference: &ConversationReference) -> String {
        let wire = normalize_outgoing(json!({ "relatesTo": reference }));
        let conversation = wire.get("relatesTo").cloned().unwrap_or_default();
        let state = json!({
            "connectionName": connection_name,
            "conversation": conversation,
            "botUrl": reference.service_url,
            "msAppId": self.app_id,
        });
        STANDARD.encode(state.to_string())
    }

    async fn send<T>(
        &self,
        operation: &'static str,
        builder: RequestBuilder,
    ) -> Result<Option<T>, ConnectorError>
    where
        T: DeserializeOwned,
    {
        let response = builder.send().await.map_err(|err| {
            counter!(
                "agents_user_token_errors_total",
                "kind" => "transport",
                "operation" => operation
            )
            .increment(1);
            ConnectorError::Transport(err)
        })?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable>".into());
            counter!(
                "agents_user_token_errors_total",
                "kind" => "remote",
                "operation" => operation,
                "status" => status.as_str().to_string()
            )
            .increment(1);
            return Err(ConnectorError::Remote {
                status,
                message: body.chars().take(512).collect(),
            });
        }
        let bytes = response.bytes().await.map_err(ConnectorError::Transport)?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| ConnectorError::Decode(err.into()))
    }
}

#[async_trait]
impl UserTokenClient for RestUserTokenClient {
    async fn get_user_token(
        &self,
        user_id: &str,
        connection_name: &str,
        channel_id: &str,
        magic_code: Option<&str>,
    ) -> Result<Option<TokenResponse>, ConnectorError> {
        let mut query = vec![
            ("userId", user_id),
            ("connectionName", connection_name),
            ("channelId", channel_id),
        ];
        if let Some(code) = magic_code {
            query.push(("code", code));
        }
        let url = self.endpoint("api/usertoken/GetToken", &query)?;
        self.send("usertoken.get", self.request(Method::GET, url))
            .await
    }

    async fn sign_out(
        &self,
        user_id: &str,
        connection_name: &str,
        channel_id: &str,
    ) -> Result<(), ConnectorError> {
        let url = self.endpoint(
            "api/usertoken/SignOut",
            &[
                ("userId", user_id),
                ("connectionName", connection_name),
                ("channelId", channel_id),
            ],
        )?;
        self.send::<serde_json::Value>("usertoken.signout", self.request(Method::DELETE, url))
            .await
            .map(|_| ())
    }

    async fn get_sign_in_resource(
        &self,
        connection_name: &str,
        reference: &ConversationReference,
        final_redirect: Option<&str>,
    ) -> Result<SignInResource, ConnectorError> {
        let state = self.sign_in_state(connection_name, reference);
        let mut query = vec![("state", state.as_str())];
        if let Some(redirect) = final_redirect {
            query.push(("finalRedirect", redirect));
        }
        let url = self.endpoint("api/botsignin/GetSignInResource", &query)?;
        self.send("signin.resource", self.request(Method::GET, url))
            .await?
            .ok_or_else(|| {
                ConnectorError::Decode(anyhow::anyhow!("sign-in resource response was empty"))
            })
    }

    async fn exchange_token(
        &self,
        user_id: &str,
        connection_name: &str,
        channel_id: &str,
        request: &TokenExchangeRequest,
    ) -> Result<Option<TokenResponse>, ConnectorError> {
        let url = self.endpoint(
            "api/usertoken/exchange",
            &[
                ("userId", user_id),
                ("connectionName", connection_name),
                ("channelId", channel_id),
            ],
        )?;
        self.send("usertoken.exchange", self.request(Method::POST, url).json(request))
            .await
    }

    async fn get_token_status(
        &self,
        user_id: &str,
        channel_id: &str,
        include_filter: Option<&str>,
    ) -> Result<Vec<TokenStatus>, ConnectorError> {
        let mut query = vec![("userId", user_id), ("channelId", channel_id)];
        if let Some(include) = include_filter {
            query.push(("include", include));
        }
        let url = self.endpoint("api/usertoken/GetTokenStatus", &query)?;
        Ok(self
            .send("usertoken.status", self.request(Method::GET, url))
            .await?
            .unwrap_or_default())
    }
}
