//! HTTP plumbing for token endpoints.
//!
//! [`TokenTransport`] is the seam between token acquisition logic and the
//! network: the reqwest implementation talks to the identity platform, the
//! mock records every request for tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Deserializer};
use tokio::sync::Mutex;
use tracing::warn;
use url::Url;

use crate::error::AuthError;

pub const JWT_BEARER_ASSERTION: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";
pub const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const APP_SERVICE_API_VERSION: &str = "2019-08-01";
const DEFAULT_LIFETIME_SECS: u64 = 3600;

#[derive(Debug, Clone, Deserialize)]
pub struct TokenEndpointResponse {
    #[serde(default)]
    pub access_token: String,
    #[serde(default, deserialize_with = "number_or_string")]
    pub expires_in: Option<u64>,
}

impl TokenEndpointResponse {
    pub fn new(access_token: impl Into<String>, expires_in: u64) -> Self {
        Self {
            access_token: access_token.into(),
            expires_in: Some(expires_in),
        }
    }

    pub fn lifetime(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.expires_in.unwrap_or(DEFAULT_LIFETIME_SECS))
    }
}

#[derive(Debug, Deserialize)]
struct TokenErrorBody {
    error: Option<String>,
    error_description: Option<String>,
}

#[async_trait]
pub trait TokenTransport: Send + Sync {
    /// Form-encoded POST to an OAuth token endpoint.
    async fn post_form(
        &self,
        url: &str,
        form: &[(String, String)],
    ) -> Result<TokenEndpointResponse, AuthError>;

    /// GET against a managed identity endpoint.
    async fn get_json(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<TokenEndpointResponse, AuthError>;
}

#[derive(Clone, Default)]
pub struct ReqwestTokenTransport {
    client: Client,
}

impl ReqwestTokenTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn read(response: reqwest::Response) -> Result<TokenEndpointResponse, AuthError> {
        let status = response.status();
        let body = response.text().await.map_err(AuthError::Transport)?;
        if !status.is_success() {
            let detail = serde_json::from_str::<TokenErrorBody>(&body)
                .ok()
                .map(|err| {
                    format!(
                        "{}: {}",
                        err.error.unwrap_or_else(|| "unknown_error".into()),
                        err.error_description.unwrap_or_default()
                    )
                })
                .unwrap_or_else(|| truncate(&body, 512));
            warn!(%status, "token endpoint rejected the request");
            return Err(AuthError::TokenAcquisition(format!("{status}: {detail}")));
        }
        let parsed: TokenEndpointResponse = serde_json::from_str(&body).map_err(|err| {
            AuthError::TokenAcquisition(format!("token endpoint returned invalid json: {err}"))
        })?;
        if parsed.access_token.is_empty() {
            return Err(AuthError::TokenAcquisition(
                "token endpoint returned no access token".into(),
            ));
        }
        Ok(parsed)
    }
}

#[async_trait]
impl TokenTransport for ReqwestTokenTransport {
    async fn post_form(
        &self,
        url: &str,
        form: &[(String, String)],
    ) -> Result<TokenEndpointResponse, AuthError> {
        let response = self
            .client
            .post(url)
            .form(form)
            .send()
            .await
            .map_err(AuthError::Transport)?;
        Self::read(response).await
    }

    async fn get_json(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<TokenEndpointResponse, AuthError> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.send().await.map_err(AuthError::Transport)?;
        Self::read(response).await
    }
}

fn truncate(body: &str, max: usize) -> String {
    body.chars().take(max).collect()
}

/// Where managed identity tokens come from on the current host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagedIdentityEndpoint {
    /// Instance metadata service of a virtual machine.
    Imds,
    /// App Service style local endpoint guarded by a shared header.
    AppService { endpoint: String, header: String },
}

impl ManagedIdentityEndpoint {
    pub fn detect() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        match (lookup("IDENTITY_ENDPOINT"), lookup("IDENTITY_HEADER")) {
            (Some(endpoint), Some(header)) if !endpoint.is_empty() && !header.is_empty() => {
                ManagedIdentityEndpoint::AppService { endpoint, header }
            }
            _ => ManagedIdentityEndpoint::Imds,
        }
    }

    /// URL and headers for a token covering `resource` issued to `client_id`.
    pub fn request(
        &self,
        resource: &str,
        client_id: &str,
    ) -> Result<(String, Vec<(String, String)>), AuthError> {
        let (base, api_version, headers) = match self {
            ManagedIdentityEndpoint::Imds => (
                IMDS_ENDPOINT,
                IMDS_API_VERSION,
                vec![("Metadata".to_string(), "true".to_string())],
            ),
            ManagedIdentityEndpoint::AppService { endpoint, header } => (
                endpoint.as_str(),
                APP_SERVICE_API_VERSION,
                vec![("X-IDENTITY-HEADER".to_string(), header.clone())],
            ),
        };
        let mut url = Url::parse(base).map_err(|err| {
            AuthError::InvalidConfiguration(format!("invalid managed identity endpoint: {err}"))
        })?;
        url.query_pairs_mut()
            .append_pair("api-version", api_version)
            .append_pair("resource", resource)
            .append_pair("client_id", client_id);
        Ok((url.to_string(), headers))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Form {
        url: String,
        params: BTreeMap<String, String>,
    },
    Get {
        url: String,
        headers: BTreeMap<String, String>,
    },
}

impl TransportCall {
    pub fn url(&self) -> &str {
        match self {
            TransportCall::Form { url, .. } | TransportCall::Get { url, .. } => url,
        }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        match self {
            TransportCall::Form { params, .. } => params.get(name).map(String::as_str),
            TransportCall::Get { .. } => None,
        }
    }
}

/// Records requests and answers each with a fresh `token-N`.
#[derive(Default)]
pub struct MockTokenTransport {
    calls: Mutex<Vec<TransportCall>>,
    issued: AtomicUsize,
    lifetime: Option<u64>,
    failure: Option<String>,
}

impl MockTokenTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lifetime(mut self, seconds: u64) -> Self {
        self.lifetime = Some(seconds);
        self
    }

    /// Every request fails with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::default()
        }
    }

    pub async fn recorded(&self) -> Vec<TransportCall> {
        self.calls.lock().await.clone()
    }

    fn respond(&self) -> Result<TokenEndpointResponse, AuthError> {
        if let Some(message) = &self.failure {
            return Err(AuthError::TokenAcquisition(message.clone()));
        }
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TokenEndpointResponse::new(
            format!("token-{n}"),
            self.lifetime.unwrap_or(DEFAULT_LIFETIME_SECS),
        ))
    }
}

#[async_trait]
impl TokenTransport for MockTokenTransport {
    async fn post_form(
        &self,
        url: &str,
        form: &[(String, String)],
    ) -> Result<TokenEndpointResponse, AuthError> {
        self.calls.lock().await.push(TransportCall::Form {
            url: url.to_string(),
            params: form.iter().cloned().collect(),
        });
        self.respond()
    }

    async fn get_json(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<TokenEndpointResponse, AuthError> {
        self.calls.lock().await.push(TransportCall::Get {
            url: url.to_string(),
            headers: headers.iter().cloned().collect(),
        });
        self.respond()
    }
}

fn number_or_string<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }
    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Number(value)) => Some(value),
        Some(Raw::Text(text)) => text.trim().parse().ok(),
        None => None,
    })
}
