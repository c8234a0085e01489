use serde_json::{Map, Value};

/// Default resource for outbound relay calls when the caller carries no app id.
pub const RELAY_SCOPE: &str = "https://api.botframework.com";

/// Verified (or anonymous) caller identity extracted from an inbound token.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClaimsIdentity {
    authenticated: bool,
    claims: Map<String, Value>,
}

impl ClaimsIdentity {
    pub fn new(claims: Map<String, Value>, authenticated: bool) -> Self {
        Self {
            authenticated,
            claims,
        }
    }

    /// Identity used when authentication is disabled in development.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Identity for proactive calls made on behalf of the agent itself.
    pub fn for_agent(app_id: impl Into<String>) -> Self {
        let mut claims = Map::new();
        claims.insert("aud".into(), Value::String(app_id.into()));
        Self::new(claims, true)
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn is_anonymous(&self) -> bool {
        !self.authenticated || self.audience().is_none()
    }

    pub fn claims(&self) -> &Map<String, Value> {
        &self.claims
    }

    pub fn claim(&self, name: &str) -> Option<&str> {
        self.claims
            .get(name)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
    }

    /// `aud` may be a string or an array; the first entry wins.
    pub fn audience(&self) -> Option<&str> {
        match self.claims.get("aud") {
            Some(Value::String(aud)) if !aud.is_empty() => Some(aud.as_str()),
            Some(Value::Array(values)) => values.iter().find_map(Value::as_str),
            _ => None,
        }
    }

    pub fn app_id(&self) -> Option<&str> {
        self.claim("azp").or_else(|| self.claim("appid"))
    }

    pub fn issuer(&self) -> Option<&str> {
        self.claim("iss")
    }

    /// Resource to request outbound tokens for: the caller's app id, or the relay.
    pub fn outgoing_scope(&self) -> String {
        self.app_id().unwrap_or(RELAY_SCOPE).to_string()
    }
}
