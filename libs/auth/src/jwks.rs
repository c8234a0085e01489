//! Signing key discovery for inbound token verification.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use metrics::counter;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument};

use crate::error::AuthError;

/// Metadata document for tokens minted by the relay.
pub const RELAY_OPENID_METADATA: &str =
    "https://login.botframework.com/v1/.well-known/openidconfiguration";
pub const DEFAULT_KEY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[async_trait]
pub trait SigningKeySource: Send + Sync {
    /// Key `kid` published behind the OpenID metadata at `discovery_url`.
    async fn signing_key(&self, discovery_url: &str, kid: &str) -> Result<Jwk, AuthError>;
}

#[derive(Debug, Deserialize)]
struct OpenIdMetadata {
    jwks_uri: String,
}

#[derive(Debug, Clone)]
struct CachedKeys {
    keys: JwkSet,
    fetched_at: Instant,
}

/// Fetches metadata and key sets over HTTP, caching each set per discovery
/// URL. An unknown `kid` forces one refresh before the lookup fails.
#[derive(Clone)]
pub struct HttpSigningKeySource {
    client: Client,
    ttl: Duration,
    cache: Arc<RwLock<HashMap<String, CachedKeys>>>,
}

impl HttpSigningKeySource {
    pub fn new(client: Client) -> Self {
        Self::with_ttl(client, DEFAULT_KEY_TTL)
    }

    pub fn with_ttl(client: Client, ttl: Duration) -> Self {
        Self {
            client,
            ttl,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn cached(&self, discovery_url: &str) -> Option<JwkSet> {
        let cache = self.cache.read().await;
        cache
            .get(discovery_url)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.keys.clone())
    }

    #[instrument(skip(self))]
    async fn refresh(&self, discovery_url: &str) -> Result<JwkSet, AuthError> {
        let metadata: OpenIdMetadata = self.fetch_json(discovery_url).await?;
        let keys: JwkSet = self.fetch_json(&metadata.jwks_uri).await?;
        info!(keys = keys.keys.len(), "refreshed signing keys");
        counter!("agents_signing_key_refreshes_total").increment(1);
        self.cache.write().await.insert(
            discovery_url.to_string(),
            CachedKeys {
                keys: keys.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(keys)
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, AuthError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| AuthError::KeyDiscovery(format!("GET {url} failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::KeyDiscovery(format!("GET {url} returned {status}")));
        }
        response
            .json::<T>()
            .await
            .map_err(|err| AuthError::KeyDiscovery(format!("GET {url} returned invalid json: {err}")))
    }
}

#[async_trait]
impl SigningKeySource for HttpSigningKeySource {
    async fn signing_key(&self, discovery_url: &str, kid: &str) -> Result<Jwk, AuthError> {
        if let Some(keys) = self.cached(discovery_url).await {
            if let Some(key) = keys.find(kid) {
                return Ok(key.clone());
            }
            debug!(kid, "unknown key id; refreshing");
        }
        let keys = self.refresh(discovery_url).await?;
        keys.find(kid)
            .cloned()
            .ok_or_else(|| AuthError::KeyDiscovery(format!("signing key `{kid}` not found")))
    }
}

/// Fixed key set that records which discovery URLs were asked for.
pub struct StaticKeySource {
    keys: JwkSet,
    requests: Mutex<Vec<String>>,
}

impl StaticKeySource {
    pub fn new(keys: JwkSet) -> Self {
        Self {
            keys,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub async fn requests(&self) -> Vec<String> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl SigningKeySource for StaticKeySource {
    async fn signing_key(&self, discovery_url: &str, kid: &str) -> Result<Jwk, AuthError> {
        self.requests.lock().await.push(discovery_url.to_string());
        self.keys
            .find(kid)
            .cloned()
            .ok_or_else(|| AuthError::KeyDiscovery(format!("signing key `{kid}` not found")))
    }
}
