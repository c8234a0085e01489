use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::debug;

/// Subtracted from every server-reported lifetime to absorb clock skew.
pub const EXPIRY_SKEW: Duration = Duration::from_secs(300);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Body parameters that never take part in a cache key.
const SECRET_PARAMS: &[&str] = &[
    "client_secret",
    "client_assertion",
    "assertion",
    "user_federated_identity_credential",
];

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: OffsetDateTime,
}

#[derive(Debug, Default)]
struct Entries {
    map: DashMap<String, CachedToken>,
}

impl Entries {
    fn purge(&self, now: OffsetDateTime) -> usize {
        let before = self.map.len();
        self.map.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.map.len())
    }
}

/// Short-lived access tokens keyed by request shape.
///
/// Expired entries are dropped lazily on read and by a background sweep that
/// starts with the first insert and stops on [`TokenCache::shutdown`] or drop.
/// Concurrent misses for the same key may both hit the token endpoint; the
/// last write wins.
#[derive(Debug)]
pub struct TokenCache {
    entries: Arc<Entries>,
    sweep_interval: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCache {
    pub fn new() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }

    pub fn with_sweep_interval(sweep_interval: Duration) -> Self {
        Self {
            entries: Arc::new(Entries::default()),
            sweep_interval,
            sweeper: Mutex::new(None),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.get_at(key, OffsetDateTime::now_utc())
    }

    pub fn get_at(&self, key: &str, now: OffsetDateTime) -> Option<String> {
        let expired = match self.entries.map.get(key) {
            Some(entry) if entry.expires_at > now => return Some(entry.token.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.map.remove(key);
        }
        None
    }

    /// Stores a token for `lifetime` minus [`EXPIRY_SKEW`].
    pub fn insert(&self, key: impl Into<String>, token: impl Into<String>, lifetime: Duration) {
        self.insert_at(key, token, lifetime, OffsetDateTime::now_utc());
    }

    pub fn insert_at(
        &self,
        key: impl Into<String>,
        token: impl Into<String>,
        lifetime: Duration,
        now: OffsetDateTime,
    ) {
        let usable = lifetime.saturating_sub(EXPIRY_SKEW);
        let expires_at = now + usable;
        self.entries.map.insert(
            key.into(),
            CachedToken {
                token: token.into(),
                expires_at,
            },
        );
        self.ensure_sweeper();
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.map.remove(key);
    }

    pub fn purge_expired(&self) -> usize {
        self.entries.purge(OffsetDateTime::now_utc())
    }

    pub fn len(&self) -> usize {
        self.entries.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.map.is_empty()
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Stops the background sweep. Entries stay readable.
    pub fn shutdown(&self) {
        if let Some(handle) = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }

    fn ensure_sweeper(&self) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.is_some() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let entries: Weak<Entries> = Arc::downgrade(&self.entries);
        let period = self.sweep_interval;
        *sweeper = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(entries) = entries.upgrade() else {
                    break;
                };
                let purged = entries.purge(OffsetDateTime::now_utc());
                if purged > 0 {
                    debug!(purged, "purged expired tokens");
                }
            }
        }));
    }
}

impl Drop for TokenCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Builds a cache key from the endpoint and the non-secret request parameters
/// (sorted). `extra` distinguishes requests whose secret part matters, such as
/// the digest of an on-behalf-of assertion.
pub fn cache_key(endpoint: &str, params: &[(String, String)], extra: Option<&str>) -> String {
    let mut pairs: Vec<String> = params
        .iter()
        .filter(|(name, _)| !SECRET_PARAMS.contains(&name.as_str()))
        .map(|(name, value)| format!("{name}={value}"))
        .collect();
    pairs.sort();
    let mut key = format!("{endpoint}|{}", pairs.join("&"));
    if let Some(extra) = extra {
        key.push('|');
        key.push_str(extra);
    }
    key
}

pub fn digest(value: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(value.as_bytes()))
}
