//! Access token acquisition for one configured connection.

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tracing::{Instrument, debug, info_span};

use crate::cache::{TokenCache, cache_key, digest};
use crate::certificate::CertificateCredential;
use crate::config::{CredentialConfig, CredentialKind};
use crate::error::AuthError;
use crate::transport::{JWT_BEARER_ASSERTION, ManagedIdentityEndpoint, TokenTransport};

pub const TOKEN_EXCHANGE_RESOURCE: &str = "api://AzureADTokenExchange";
const DEFAULT_SCOPE_SUFFIX: &str = "/.default";

#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    /// App-only token for `scope`. Bare resources get `/.default` appended.
    async fn get_access_token(&self, scope: &str, force_refresh: bool) -> Result<String, AuthError>;

    /// Exchanges a user assertion for a downstream token.
    async fn acquire_token_on_behalf_of(
        &self,
        scopes: &[String],
        assertion: &str,
    ) -> Result<String, AuthError>;

    async fn get_agentic_application_token(
        &self,
        tenant_id: Option<&str>,
        instance_id: &str,
    ) -> Result<String, AuthError>;

    async fn get_agentic_instance_token(
        &self,
        tenant_id: Option<&str>,
        instance_id: &str,
    ) -> Result<String, AuthError>;

    async fn get_agentic_user_token(
        &self,
        tenant_id: Option<&str>,
        instance_id: &str,
        user: &str,
        scopes: &[String],
    ) -> Result<String, AuthError>;

    /// Client id of the application this provider acts as.
    fn client_id(&self) -> &str;
}

/// Appends `/.default` unless the scope already names a permission.
pub fn default_scope(scope: &str) -> String {
    let scope = scope.trim();
    if scope.ends_with(DEFAULT_SCOPE_SUFFIX) {
        scope.to_string()
    } else {
        format!("{}{DEFAULT_SCOPE_SUFFIX}", scope.trim_end_matches('/'))
    }
}

fn resource_of(scope: &str) -> &str {
    scope.strip_suffix(DEFAULT_SCOPE_SUFFIX).unwrap_or(scope)
}

pub(crate) fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
    items
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

/// Secret material appended to a token request after the cache lookup.
pub(crate) enum ClientAuth {
    /// The connection's own credential (secret, certificate or federated).
    Configured,
    Assertion(String),
}

/// Token provider backed by the credential of one connection.
pub struct CredentialTokenProvider {
    config: CredentialConfig,
    kind: CredentialKind,
    transport: Arc<dyn TokenTransport>,
    cache: TokenCache,
    certificate: Option<CertificateCredential>,
    managed_identity: ManagedIdentityEndpoint,
}

impl CredentialTokenProvider {
    /// Fails fast on conflicting credentials or unreadable certificate files.
    pub fn new(config: CredentialConfig, transport: Arc<dyn TokenTransport>) -> Result<Self, AuthError> {
        let certificate = match config.certificate_files() {
            Some((pem, key)) => Some(CertificateCredential::from_files(pem, key)?),
            None => None,
        };
        Self::build(config, transport, certificate)
    }

    /// Uses an already loaded certificate instead of the configured files.
    pub fn with_certificate(
        config: CredentialConfig,
        transport: Arc<dyn TokenTransport>,
        certificate: CertificateCredential,
    ) -> Result<Self, AuthError> {
        Self::build(config, transport, Some(certificate))
    }

    fn build(
        config: CredentialConfig,
        transport: Arc<dyn TokenTransport>,
        certificate: Option<CertificateCredential>,
    ) -> Result<Self, AuthError> {
        let kind = config.credential_kind()?;
        if kind == CredentialKind::Certificate && certificate.is_none() {
            return Err(AuthError::InvalidConfiguration(
                "certificate credential requires certPemFile and certKeyFile".into(),
            ));
        }
        Ok(Self {
            config,
            kind,
            transport,
            cache: TokenCache::new(),
            certificate,
            managed_identity: ManagedIdentityEndpoint::detect(),
        })
    }

    pub fn with_managed_identity_endpoint(mut self, endpoint: ManagedIdentityEndpoint) -> Self {
        self.managed_identity = endpoint;
        self
    }

    pub fn config(&self) -> &CredentialConfig {
        &self.config
    }

    pub fn kind(&self) -> CredentialKind {
        self.kind
    }

    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }

    /// Posts a token request unless an unexpired token for the same request
    /// shape is cached. `params` must hold only non-secret values.
    pub(crate) async fn exchange(
        &self,
        flow: &'static str,
        endpoint: &str,
        mut params: Vec<(String, String)>,
        auth: ClientAuth,
        key_extra: Option<&str>,
        force_refresh: bool,
    ) -> Result<String, AuthError> {
        let key = cache_key(endpoint, &params, key_extra);
        if !force_refresh {
            if let Some(token) = self.cache.get(&key) {
                counter!("agents_token_cache_hits_total", "flow" => flow).increment(1);
                return Ok(token);
            }
        }
        match auth {
            ClientAuth::Configured => params.extend(self.client_credentials(endpoint).await?),
            ClientAuth::Assertion(assertion) => {
                params.push(("client_assertion_type".into(), JWT_BEARER_ASSERTION.into()));
                params.push(("client_assertion".into(), assertion));
            }
        }
        debug!(flow, endpoint, "requesting token");
        let response = self.transport.post_form(endpoint, &params).await?;
        counter!("agents_tokens_acquired_total", "flow" => flow).increment(1);
        self.cache
            .insert(key, response.access_token.clone(), response.lifetime());
        Ok(response.access_token)
    }

    async fn client_credentials(&self, endpoint: &str) -> Result<Vec<(String, String)>, AuthError> {
        match self.kind {
            CredentialKind::ClientSecret => {
                let secret = self.config.client_secret().unwrap_or_default();
                Ok(pairs(&[("client_secret", secret)]))
            }
            CredentialKind::Certificate => {
                let certificate = self.certificate.as_ref().ok_or_else(|| {
                    AuthError::InvalidConfiguration("certificate not loaded".into())
                })?;
                let assertion = certificate.client_assertion(
                    self.config.client_id(),
                    endpoint,
                    self.config.send_x5c,
                )?;
                Ok(pairs(&[
                    ("client_assertion_type", JWT_BEARER_ASSERTION),
                    ("client_assertion", assertion.as_str()),
                ]))
            }
            CredentialKind::FederatedIdentity => {
                let fic_client_id = self.config.fic_client_id().unwrap_or_default();
                let assertion = self
                    .managed_identity_token(TOKEN_EXCHANGE_RESOURCE, fic_client_id, false)
                    .await?;
                Ok(pairs(&[
                    ("client_assertion_type", JWT_BEARER_ASSERTION),
                    ("client_assertion", assertion.as_str()),
                ]))
            }
            CredentialKind::ManagedIdentity => Err(AuthError::InvalidConfiguration(
                "managed identity connections cannot authenticate to the token endpoint".into(),
            )),
        }
    }

    async fn managed_identity_token(
        &self,
        resource: &str,
        client_id: &str,
        force_refresh: bool,
    ) -> Result<String, AuthError> {
        let (url, headers) = self.managed_identity.request(resource, client_id)?;
        let key = cache_key(
            "managed_identity",
            &pairs(&[("resource", resource), ("client_id", client_id)]),
            None,
        );
        if !force_refresh {
            if let Some(token) = self.cache.get(&key) {
                counter!("agents_token_cache_hits_total", "flow" => "managed_identity").increment(1);
                return Ok(token);
            }
        }
        let response = self.transport.get_json(&url, &headers).await?;
        counter!("agents_tokens_acquired_total", "flow" => "managed_identity").increment(1);
        self.cache
            .insert(key, response.access_token.clone(), response.lifetime());
        Ok(response.access_token)
    }
}

impl std::fmt::Debug for CredentialTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialTokenProvider")
            .field("client_id", &self.config.client_id())
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AccessTokenProvider for CredentialTokenProvider {
    async fn get_access_token(&self, scope: &str, force_refresh: bool) -> Result<String, AuthError> {
        let scope = default_scope(scope);
        let span = info_span!(
            "access_token",
            client_id = %self.config.client_id(),
            kind = self.kind.as_str(),
            %scope
        );
        async {
            if self.kind == CredentialKind::ManagedIdentity {
                return self
                    .managed_identity_token(resource_of(&scope), self.config.client_id(), force_refresh)
                    .await;
            }
            let endpoint = self.config.token_endpoint(None);
            let params = pairs(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.config.client_id()),
                ("scope", scope.as_str()),
            ]);
            self.exchange(
                "client_credentials",
                &endpoint,
                params,
                ClientAuth::Configured,
                None,
                force_refresh,
            )
            .await
        }
        .instrument(span)
        .await
    }

    async fn acquire_token_on_behalf_of(
        &self,
        scopes: &[String],
        assertion: &str,
    ) -> Result<String, AuthError> {
        let endpoint = self.config.token_endpoint(None);
        let scope = scopes.join(" ");
        let params = pairs(&[
            ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
            ("client_id", self.config.client_id()),
            ("requested_token_use", "on_behalf_of"),
            ("scope", scope.as_str()),
        ]);
        let key_extra = digest(assertion);
        let key = cache_key(&endpoint, &params, Some(&key_extra));
        if let Some(token) = self.cache.get(&key) {
            counter!("agents_token_cache_hits_total", "flow" => "on_behalf_of").increment(1);
            return Ok(token);
        }
        let mut form = params;
        form.extend(self.client_credentials(&endpoint).await?);
        form.push(("assertion".into(), assertion.to_string()));
        let response = self
            .transport
            .post_form(&endpoint, &form)
            .instrument(info_span!("on_behalf_of", client_id = %self.config.client_id()))
            .await?;
        counter!("agents_tokens_acquired_total", "flow" => "on_behalf_of").increment(1);
        self.cache
            .insert(key, response.access_token.clone(), response.lifetime());
        Ok(response.access_token)
    }

    async fn get_agentic_application_token(
        &self,
        tenant_id: Option<&str>,
        instance_id: &str,
    ) -> Result<String, AuthError> {
        self.agentic_application_token(tenant_id, instance_id).await
    }

    async fn get_agentic_instance_token(
        &self,
        tenant_id: Option<&str>,
        instance_id: &str,
    ) -> Result<String, AuthError> {
        self.agentic_instance_token(tenant_id, instance_id).await
    }

    async fn get_agentic_user_token(
        &self,
        tenant_id: Option<&str>,
        instance_id: &str,
        user: &str,
        scopes: &[String],
    ) -> Result<String, AuthError> {
        self.agentic_user_token(tenant_id, instance_id, user, scopes)
            .await
    }

    fn client_id(&self) -> &str {
        self.config.client_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockTokenTransport, TransportCall};

    fn secret_provider(transport: Arc<MockTokenTransport>) -> CredentialTokenProvider {
        CredentialTokenProvider::new(
            CredentialConfig::new("app-1")
                .with_tenant("tenant-1")
                .with_secret("s3cret"),
            transport,
        )
        .unwrap()
    }

    #[test]
    fn default_scope_is_appended_once() {
        assert_eq!(
            default_scope("https://api.botframework.com"),
            "https://api.botframework.com/.default"
        );
        assert_eq!(default_scope("api://x/.default"), "api://x/.default");
    }

    #[tokio::test]
    async fn client_secret_tokens_are_cached_until_forced() {
        let transport = Arc::new(MockTokenTransport::new());
        let provider = secret_provider(transport.clone());

        let first = provider
            .get_access_token("https://api.botframework.com", false)
            .await
            .unwrap();
        let second = provider
            .get_access_token("https://api.botframework.com/.default", false)
            .await
            .unwrap();
        assert_eq!(first, second);

        let forced = provider
            .get_access_token("https://api.botframework.com", true)
            .await
            .unwrap();
        assert_ne!(first, forced);

        let calls = transport.recorded().await;
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[0].url(),
            "https://login.microsoftonline.com/tenant-1/oauth2/v2.0/token"
        );
        assert_eq!(calls[0].param("grant_type"), Some("client_credentials"));
        assert_eq!(calls[0].param("client_secret"), Some("s3cret"));
        assert_eq!(
            calls[0].param("scope"),
            Some("https://api.botframework.com/.default")
        );
    }

    #[tokio::test]
    async fn federated_credential_uses_managed_identity_assertion() {
        let transport = Arc::new(MockTokenTransport::new());
        let provider = CredentialTokenProvider::new(
            CredentialConfig::new("app-1").with_fic_client_id("mi-client"),
            transport.clone(),
        )
        .unwrap()
        .with_managed_identity_endpoint(ManagedIdentityEndpoint::Imds);

        let token = provider.get_access_token("api://downstream", false).await.unwrap();
        assert_eq!(token, "token-2");

        let calls = transport.recorded().await;
        match &calls[..] {
            [TransportCall::Get { url, headers }, post @ TransportCall::Form { .. }] => {
                assert!(url.contains("client_id=mi-client"));
                assert!(url.contains("resource=api%3A%2F%2FAzureADTokenExchange"));
                assert_eq!(headers.get("Metadata").map(String::as_str), Some("true"));
                assert_eq!(post.param("client_assertion"), Some("token-1"));
                assert_eq!(post.param("client_assertion_type"), Some(JWT_BEARER_ASSERTION));
                assert_eq!(post.param("client_id"), Some("app-1"));
            }
            other => panic!("unexpected calls: {other:?}"),
        }
    }

    #[tokio::test]
    async fn managed_identity_requests_resource_without_default_suffix() {
        let transport = Arc::new(MockTokenTransport::new());
        let provider = CredentialTokenProvider::new(CredentialConfig::new("mi-app"), transport.clone())
            .unwrap()
            .with_managed_identity_endpoint(ManagedIdentityEndpoint::Imds);

        provider
            .get_access_token("https://api.botframework.com", false)
            .await
            .unwrap();
        let calls = transport.recorded().await;
        assert!(calls[0].url().contains("resource=https%3A%2F%2Fapi.botframework.com&"));
        assert!(calls[0].url().contains("client_id=mi-app"));
    }

    #[tokio::test]
    async fn on_behalf_of_keys_on_assertion() {
        let transport = Arc::new(MockTokenTransport::new());
        let provider = secret_provider(transport.clone());
        let scopes = vec!["api://graph/.default".to_string()];

        let a = provider.acquire_token_on_behalf_of(&scopes, "user-a").await.unwrap();
        let again = provider.acquire_token_on_behalf_of(&scopes, "user-a").await.unwrap();
        let b = provider.acquire_token_on_behalf_of(&scopes, "user-b").await.unwrap();
        assert_eq!(a, again);
        assert_ne!(a, b);

        let calls = transport.recorded().await;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].param("requested_token_use"), Some("on_behalf_of"));
        assert_eq!(calls[0].param("assertion"), Some("user-a"));
    }

    #[tokio::test]
    async fn endpoint_failures_propagate() {
        let provider = secret_provider(Arc::new(MockTokenTransport::failing("invalid_client")));
        let err = provider
            .get_access_token("https://api.botframework.com", false)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::TokenAcquisition(ref reason) if reason == "invalid_client"));
    }

    #[test]
    fn certificate_kind_requires_loadable_files() {
        let err = CredentialTokenProvider::new(
            CredentialConfig::new("app-1").with_certificate("/missing/cert.pem", "/missing/key.pem"),
            Arc::new(MockTokenTransport::new()),
        )
        .unwrap_err();
        assert!(matches!(err, AuthError::InvalidConfiguration(_)));
    }
}
