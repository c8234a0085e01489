//! Inbound bearer token verification.
//!
//! Audience is checked against the configured connections before any key
//! lookup so that tokens meant for another application never trigger network
//! traffic. Anonymous access is only granted when nothing is configured and
//! the host does not run in production.

use std::sync::Arc;

use agents_core::ClaimsIdentity;
use agents_core::identity::RELAY_SCOPE;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use metrics::counter;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::{AgentsConfig, CredentialConfig, Environment, RELAY_ISSUER};
use crate::error::AuthError;
use crate::jwks::{RELAY_OPENID_METADATA, SigningKeySource};

pub const CLOCK_TOLERANCE_SECS: u64 = 300;

const ALLOWED_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
    Algorithm::ES256,
    Algorithm::ES384,
];

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verifies the raw `Authorization` header value.
    async fn verify(&self, authorization: Option<&str>) -> Result<ClaimsIdentity, AuthError>;
}

pub struct JwtVerifier {
    credentials: Vec<CredentialConfig>,
    environment: Environment,
    keys: Arc<dyn SigningKeySource>,
}

impl JwtVerifier {
    pub fn new(
        credentials: Vec<CredentialConfig>,
        environment: Environment,
        keys: Arc<dyn SigningKeySource>,
    ) -> Self {
        Self {
            credentials,
            environment,
            keys,
        }
    }

    pub fn from_config(config: &AgentsConfig, keys: Arc<dyn SigningKeySource>) -> Self {
        Self::new(
            config
                .connections
                .values()
                .map(|connection| connection.settings.clone())
                .collect(),
            config.agents.environment,
            keys,
        )
    }

    fn anonymous_allowed(&self) -> bool {
        self.credentials.is_empty() && self.environment != Environment::Production
    }

    async fn verify_token(&self, authorization: Option<&str>) -> Result<ClaimsIdentity, &'static str> {
        if self.anonymous_allowed() {
            return Ok(ClaimsIdentity::anonymous());
        }
        if self.credentials.is_empty() {
            return Err("no client id configured");
        }
        let header = authorization
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or("missing authorization header")?;
        let token = bearer_token(header).ok_or("authorization header must use the Bearer scheme")?;

        let peeked = peek_claims(token).ok_or("malformed token")?;
        let audiences = audiences(&peeked);
        let credential = self
            .credentials
            .iter()
            .find(|credential| audiences.iter().any(|aud| *aud == credential.client_id()))
            .ok_or("audience mismatch")?;

        let header = decode_header(token).map_err(|_| "malformed token header")?;
        if !ALLOWED_ALGORITHMS.contains(&header.alg) {
            return Err("algorithm not allowed");
        }
        let kid = header.kid.as_deref().ok_or("token has no key id")?;

        let issuer = peeked.get("iss").and_then(Value::as_str).unwrap_or_default();
        let discovery = discovery_url(credential, issuer);
        let jwk = self.keys.signing_key(&discovery, kid).await.map_err(|err| {
            warn!(error = %err, "signing key lookup failed");
            "signing key unavailable"
        })?;
        let key = DecodingKey::from_jwk(&jwk).map_err(|_| "unusable signing key")?;

        let mut validation = Validation::new(header.alg);
        validation.leeway = CLOCK_TOLERANCE_SECS;
        validation.set_audience(&[credential.client_id(), RELAY_SCOPE]);
        let issuers = credential.issuers();
        validation.set_issuer(issuers.as_slice());
        let data = decode::<Map<String, Value>>(token, &key, &validation).map_err(|err| {
            debug!(error = %err, "token validation failed");
            "token validation failed"
        })?;
        Ok(ClaimsIdentity::new(data.claims, true))
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, authorization: Option<&str>) -> Result<ClaimsIdentity, AuthError> {
        self.verify_token(authorization).await.map_err(|reason| {
            counter!("agents_token_verification_failures_total", "reason" => reason).increment(1);
            AuthError::unauthorized(reason)
        })
    }
}

fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then_some(token.trim())
        .filter(|token| !token.is_empty())
}

/// Claims read without checking the signature, used only for routing.
fn peek_claims(token: &str) -> Option<Map<String, Value>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn audiences(claims: &Map<String, Value>) -> Vec<&str> {
    match claims.get("aud") {
        Some(Value::String(aud)) => vec![aud.as_str()],
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

fn discovery_url(credential: &CredentialConfig, issuer: &str) -> String {
    if issuer == RELAY_ISSUER {
        RELAY_OPENID_METADATA.to_string()
    } else {
        format!(
            "{}/{}/v2.0/.well-known/openid-configuration",
            credential.authority(),
            credential.tenant()
        )
    }
}
