#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use agents_auth::{
    AccessTokenProvider, AuthError, Connections, CredentialConfig, CredentialTokenProvider,
    MockTokenTransport, TokenVerifier,
};
use agents_core::{Activity, ClaimsIdentity, ConnectorCall};
use agents_hosting::{CloudAdapter, MockConnectorFactory};
use async_trait::async_trait;
use serde_json::{Value, json};

pub const SERVICE_URL: &str = "https://relay.example/";

pub enum StubVerifier {
    Accept(ClaimsIdentity),
    Reject,
}

#[async_trait]
impl TokenVerifier for StubVerifier {
    async fn verify(&self, _authorization: Option<&str>) -> Result<ClaimsIdentity, AuthError> {
        match self {
            StubVerifier::Accept(identity) => Ok(identity.clone()),
            StubVerifier::Reject => Err(AuthError::unauthorized("missing token")),
        }
    }
}

/// Single-connection resolver that counts every lookup.
pub struct CountingConnections {
    config: CredentialConfig,
    provider: Arc<dyn AccessTokenProvider>,
    lookups: AtomicUsize,
}

impl CountingConnections {
    pub fn new(transport: Arc<MockTokenTransport>) -> Self {
        let config = CredentialConfig::new("app-1")
            .with_tenant("tenant-1")
            .with_secret("s3cret");
        let provider = CredentialTokenProvider::new(config.clone(), transport).unwrap();
        Self {
            config,
            provider: Arc::new(provider),
            lookups: AtomicUsize::new(0),
        }
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    fn lookup(&self) -> Result<Arc<dyn AccessTokenProvider>, AuthError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.provider.clone())
    }
}

impl Connections for CountingConnections {
    fn connection(&self, _name: &str) -> Result<Arc<dyn AccessTokenProvider>, AuthError> {
        self.lookup()
    }

    fn default_connection(&self) -> Result<Arc<dyn AccessTokenProvider>, AuthError> {
        self.lookup()
    }

    fn token_provider(
        &self,
        _identity: &ClaimsIdentity,
        _service_url: &str,
    ) -> Result<Arc<dyn AccessTokenProvider>, AuthError> {
        self.lookup()
    }

    fn credentials(&self) -> Vec<CredentialConfig> {
        vec![self.config.clone()]
    }
}

pub struct Harness {
    pub adapter: CloudAdapter,
    pub connections: Arc<CountingConnections>,
    pub factory: Arc<MockConnectorFactory>,
    pub transport: Arc<MockTokenTransport>,
}

pub fn relay_identity() -> ClaimsIdentity {
    let claims = json!({
        "aud": "app-1",
        "appid": "relay-app",
        "iss": "https://api.botframework.com",
    });
    ClaimsIdentity::new(claims.as_object().cloned().unwrap_or_default(), true)
}

pub fn harness(verifier: StubVerifier) -> Harness {
    let transport = Arc::new(MockTokenTransport::new());
    let connections = Arc::new(CountingConnections::new(transport.clone()));
    let factory = Arc::new(MockConnectorFactory::new());
    let adapter = CloudAdapter::new(Arc::new(verifier), connections.clone(), factory.clone());
    Harness {
        adapter,
        connections,
        factory,
        transport,
    }
}

pub fn message(channel: &str) -> Value {
    json!({
        "type": "message",
        "id": "in-1",
        "channelId": channel,
        "serviceUrl": SERVICE_URL,
        "from": { "id": "user-1", "role": "user" },
        "recipient": { "id": "app-1", "role": "bot" },
        "conversation": { "id": "conv-1" },
        "text": "hello",
    })
}

pub fn body(value: &Value) -> Vec<u8> {
    serde_json::to_vec(value).unwrap()
}

/// Activities delivered through the connector, in call order.
pub fn delivered(calls: &[ConnectorCall]) -> Vec<Activity> {
    calls
        .iter()
        .filter_map(|call| match call {
            ConnectorCall::SendToConversation { activity, .. }
            | ConnectorCall::ReplyToActivity { activity, .. } => Some(activity.clone()),
            _ => None,
        })
        .collect()
}
