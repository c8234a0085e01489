use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use agents_auth::jwks::RELAY_OPENID_METADATA;
use agents_auth::{
    AuthError, CredentialConfig, Environment, HttpSigningKeySource, JwtVerifier, SigningKeySource,
    StaticKeySource, TokenVerifier,
};
use axum::Router;
use axum::extract::State;
use axum::routing::get;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde_json::{Value, json};
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tracing_test::traced_test;

struct Signer {
    private_pem: String,
    jwks: Value,
}

fn signer() -> &'static Signer {
    static SIGNER: OnceLock<Signer> = OnceLock::new();
    SIGNER.get_or_init(|| {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048).expect("generate rsa key");
        let private_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .expect("encode private key")
            .to_string();
        let public = private_key.to_public_key();
        let jwks = json!({
            "keys": [{
                "kty": "RSA",
                "kid": "key-1",
                "use": "sig",
                "alg": "RS256",
                "n": URL_SAFE_NO_PAD.encode(public.n().to_bytes_be()),
                "e": URL_SAFE_NO_PAD.encode(public.e().to_bytes_be()),
            }]
        });
        Signer { private_pem, jwks }
    })
}

fn key_set() -> JwkSet {
    serde_json::from_value(signer().jwks.clone()).unwrap()
}

fn token(claims: Value, kid: &str) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    let key = EncodingKey::from_rsa_pem(signer().private_pem.as_bytes()).unwrap();
    encode(&header, &claims, &key).unwrap()
}

fn claims(aud: &str, iss: &str, exp_offset: i64) -> Value {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    json!({
        "aud": aud,
        "iss": iss,
        "appid": "relay-app",
        "serviceurl": "https://relay.example/",
        "iat": now,
        "nbf": now,
        "exp": now + exp_offset,
    })
}

fn credential() -> CredentialConfig {
    CredentialConfig::new("app-1").with_tenant("tenant-1")
}

fn verifier(keys: Arc<dyn SigningKeySource>) -> JwtVerifier {
    JwtVerifier::new(vec![credential()], Environment::Production, keys)
}

fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}

#[tokio::test]
async fn valid_relay_token_yields_authenticated_identity() {
    let keys = Arc::new(StaticKeySource::new(key_set()));
    let verifier = verifier(keys.clone());
    let token = token(claims("app-1", "https://api.botframework.com", 3600), "key-1");

    let identity = verifier.verify(Some(&bearer(&token))).await.unwrap();
    assert!(identity.is_authenticated());
    assert_eq!(identity.audience(), Some("app-1"));
    assert_eq!(identity.app_id(), Some("relay-app"));
    assert_eq!(keys.requests().await, vec![RELAY_OPENID_METADATA.to_string()]);
}

#[tokio::test]
async fn tenant_issued_token_uses_tenant_metadata() {
    let keys = Arc::new(StaticKeySource::new(key_set()));
    let verifier = verifier(keys.clone());
    let token = token(claims("app-1", "https://sts.windows.net/tenant-1/", 3600), "key-1");

    verifier.verify(Some(&bearer(&token))).await.unwrap();
    assert_eq!(
        keys.requests().await,
        vec!["https://login.microsoftonline.com/tenant-1/v2.0/.well-known/openid-configuration".to_string()]
    );
}

#[tokio::test]
async fn audience_mismatch_is_rejected_before_key_lookup() {
    let keys = Arc::new(StaticKeySource::new(key_set()));
    let verifier = verifier(keys.clone());
    let token = token(claims("someone-else", "https://api.botframework.com", 3600), "key-1");

    let err = verifier.verify(Some(&bearer(&token))).await.unwrap_err();
    assert!(matches!(err, AuthError::Unauthorized { ref reason } if reason == "audience mismatch"));
    assert_eq!(err.status(), http::StatusCode::UNAUTHORIZED);
    assert!(keys.requests().await.is_empty());
}

#[tokio::test]
async fn expired_and_foreign_issuer_tokens_are_rejected() {
    let verifier = verifier(Arc::new(StaticKeySource::new(key_set())));

    let expired = token(claims("app-1", "https://api.botframework.com", -3600), "key-1");
    assert!(verifier.verify(Some(&bearer(&expired))).await.is_err());

    let within_tolerance = token(claims("app-1", "https://api.botframework.com", -60), "key-1");
    assert!(verifier.verify(Some(&bearer(&within_tolerance))).await.is_ok());

    let foreign = token(claims("app-1", "https://evil.example/", 3600), "key-1");
    let err = verifier.verify(Some(&bearer(&foreign))).await.unwrap_err();
    assert!(matches!(err, AuthError::Unauthorized { .. }));
}

#[tokio::test]
async fn missing_or_malformed_headers_are_unauthorized() {
    let verifier = verifier(Arc::new(StaticKeySource::new(key_set())));
    for header in [None, Some(""), Some("Basic abc"), Some("Bearer not-a-jwt")] {
        let err = verifier.verify(header).await.unwrap_err();
        assert!(matches!(err, AuthError::Unauthorized { .. }), "{header:?}");
    }
}

#[tokio::test]
#[traced_test]
async fn unknown_signing_key_is_logged_and_rejected() {
    let verifier = verifier(Arc::new(StaticKeySource::new(key_set())));
    let unknown_kid = token(claims("app-1", "https://api.botframework.com", 3600), "key-9");
    let err = verifier.verify(Some(&bearer(&unknown_kid))).await.unwrap_err();
    assert_eq!(err.status(), http::StatusCode::UNAUTHORIZED);
    assert!(logs_contain("signing key lookup failed"));
}

#[tokio::test]
async fn anonymous_only_outside_production_without_configuration() {
    let keys: Arc<dyn SigningKeySource> = Arc::new(StaticKeySource::new(key_set()));

    let development = JwtVerifier::new(Vec::new(), Environment::Development, keys.clone());
    let identity = development.verify(None).await.unwrap();
    assert!(identity.is_anonymous());

    let production = JwtVerifier::new(Vec::new(), Environment::Production, keys);
    assert!(production.verify(None).await.is_err());
}

#[derive(Clone)]
struct Discovery {
    base: String,
    jwks_fetches: Arc<AtomicUsize>,
}

// Skips when binding to localhost is not permitted in the current environment.
async fn discovery_server() -> Option<(SocketAddr, Arc<AtomicUsize>)> {
    let listener = match TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("skipping key discovery test: {err}");
            return None;
        }
    };
    let addr = listener.local_addr().unwrap();
    let jwks_fetches = Arc::new(AtomicUsize::new(0));
    let state = Discovery {
        base: format!("http://{addr}"),
        jwks_fetches: jwks_fetches.clone(),
    };
    let app = Router::new()
        .route(
            "/.well-known/openid-configuration",
            get(|State(state): State<Discovery>| async move {
                axum::Json(json!({ "jwks_uri": format!("{}/keys", state.base) }))
            }),
        )
        .route(
            "/keys",
            get(|State(state): State<Discovery>| async move {
                state.jwks_fetches.fetch_add(1, Ordering::SeqCst);
                axum::Json(signer().jwks.clone())
            }),
        )
        .with_state(state);
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app.into_make_service()).await {
            eprintln!("discovery mock server error: {err}");
        }
    });
    Some((addr, jwks_fetches))
}

#[tokio::test]
async fn http_key_source_caches_and_refreshes_on_unknown_kid() {
    let Some((addr, fetches)) = discovery_server().await else {
        return;
    };
    let source = HttpSigningKeySource::new(reqwest::Client::new());
    let discovery = format!("http://{addr}/.well-known/openid-configuration");

    let key = source.signing_key(&discovery, "key-1").await.unwrap();
    assert_eq!(key.common.key_id.as_deref(), Some("key-1"));
    source.signing_key(&discovery, "key-1").await.unwrap();
    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    let err = source.signing_key(&discovery, "rotated").await.unwrap_err();
    assert!(matches!(err, AuthError::KeyDiscovery(_)));
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
}
