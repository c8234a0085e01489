//! Maps an inbound request to the connection whose credential answers it.

use std::collections::BTreeMap;
use std::sync::Arc;

use agents_core::{Activity, ClaimsIdentity};
use regex::Regex;
use tracing::debug;

use crate::config::{AgentsConfig, ConnectionMapEntry, CredentialConfig, DEFAULT_CONNECTION, WILDCARD};
use crate::error::AuthError;
use crate::provider::{AccessTokenProvider, CredentialTokenProvider};
use crate::transport::TokenTransport;

pub trait Connections: Send + Sync {
    fn connection(&self, name: &str) -> Result<Arc<dyn AccessTokenProvider>, AuthError>;

    fn default_connection(&self) -> Result<Arc<dyn AccessTokenProvider>, AuthError>;

    /// Provider for the audience of `identity` calling back to `service_url`.
    fn token_provider(
        &self,
        identity: &ClaimsIdentity,
        service_url: &str,
    ) -> Result<Arc<dyn AccessTokenProvider>, AuthError>;

    fn token_provider_for_activity(
        &self,
        identity: &ClaimsIdentity,
        activity: &Activity,
    ) -> Result<Arc<dyn AccessTokenProvider>, AuthError> {
        self.token_provider(identity, activity.service_url.as_deref().unwrap_or_default())
    }

    /// Credentials of every configured connection.
    fn credentials(&self) -> Vec<CredentialConfig>;
}

struct Connection {
    config: CredentialConfig,
    provider: Arc<dyn AccessTokenProvider>,
}

struct Route {
    audience: String,
    /// `None` for the wildcard.
    service_url: Option<Regex>,
    connection: String,
}

impl Route {
    fn compile(index: usize, entry: &ConnectionMapEntry) -> Result<Self, AuthError> {
        let pattern = entry.service_url.trim();
        let service_url = if pattern.is_empty() || pattern == WILDCARD {
            None
        } else {
            Some(Regex::new(&format!("(?i){pattern}")).map_err(|err| {
                AuthError::InvalidConfiguration(format!(
                    "connectionsMap[{index}] has an invalid serviceUrl pattern: {err}"
                ))
            })?)
        };
        let audience = entry
            .audience
            .as_deref()
            .map(str::trim)
            .filter(|audience| !audience.is_empty())
            .ok_or_else(|| {
                AuthError::InvalidConfiguration(format!("connectionsMap[{index}] has no audience"))
            })?;
        Ok(Self {
            audience: audience.to_string(),
            service_url,
            connection: entry.connection.clone(),
        })
    }

    fn matches(&self, audience: Option<&str>, service_url: &str) -> bool {
        audience == Some(self.audience.as_str())
            && self
                .service_url
                .as_ref()
                .map(|pattern| pattern.is_match(service_url))
                .unwrap_or(true)
    }
}

/// Named connections plus the ordered connection map. First matching map entry
/// wins; an unmatched request is an error rather than a silent fallback.
pub struct ConnectionManager {
    connections: BTreeMap<String, Connection>,
    routes: Vec<Route>,
}

impl ConnectionManager {
    pub fn from_config(
        config: &AgentsConfig,
        transport: Arc<dyn TokenTransport>,
    ) -> Result<Self, AuthError> {
        Self::with_providers(config, |settings| {
            let provider = CredentialTokenProvider::new(settings.clone(), transport.clone())?;
            Ok(Arc::new(provider) as Arc<dyn AccessTokenProvider>)
        })
    }

    /// Builds providers through `factory`, one per configured connection.
    pub fn with_providers<F>(config: &AgentsConfig, factory: F) -> Result<Self, AuthError>
    where
        F: Fn(&CredentialConfig) -> Result<Arc<dyn AccessTokenProvider>, AuthError>,
    {
        config.validate()?;
        let mut connections = BTreeMap::new();
        for (name, connection) in &config.connections {
            let provider = factory(&connection.settings).map_err(|err| {
                AuthError::InvalidConfiguration(format!("connection `{name}`: {err}"))
            })?;
            connections.insert(
                name.clone(),
                Connection {
                    config: connection.settings.clone(),
                    provider,
                },
            );
        }
        let routes = config
            .connections_map
            .iter()
            .enumerate()
            .map(|(index, entry)| Route::compile(index, entry))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { connections, routes })
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Name of the connection serving `audience` at `service_url`.
    pub fn resolve_name(&self, audience: Option<&str>, service_url: &str) -> Result<&str, AuthError> {
        if self.routes.is_empty() {
            return self.default_name();
        }
        self.routes
            .iter()
            .find(|route| route.matches(audience, service_url))
            .map(|route| route.connection.as_str())
            .ok_or_else(|| AuthError::ConnectionNotFound {
                audience: audience.unwrap_or_default().to_string(),
                service_url: service_url.to_string(),
            })
    }

    pub fn resolve(&self, audience: Option<&str>, service_url: &str) -> Result<&CredentialConfig, AuthError> {
        let name = self.resolve_name(audience, service_url)?;
        self.named(name).map(|connection| &connection.config)
    }

    fn named(&self, name: &str) -> Result<&Connection, AuthError> {
        self.connections
            .get(name)
            .ok_or_else(|| AuthError::InvalidConfiguration(format!("unknown connection `{name}`")))
    }

    fn default_name(&self) -> Result<&str, AuthError> {
        let wildcard = self
            .routes
            .iter()
            .find(|route| route.service_url.is_none())
            .map(|route| route.connection.as_str());
        if let Some(name) = wildcard {
            return Ok(name);
        }
        if let Some((name, _)) = self.connections.get_key_value(DEFAULT_CONNECTION) {
            return Ok(name.as_str());
        }
        match self.connections.keys().next() {
            Some(name) if self.connections.len() == 1 => Ok(name.as_str()),
            Some(_) => Err(AuthError::InvalidConfiguration(format!(
                "several connections configured but none named `{DEFAULT_CONNECTION}`"
            ))),
            None => Err(AuthError::InvalidConfiguration("no connections configured".into())),
        }
    }
}

impl Connections for ConnectionManager {
    fn connection(&self, name: &str) -> Result<Arc<dyn AccessTokenProvider>, AuthError> {
        self.named(name).map(|connection| connection.provider.clone())
    }

    fn default_connection(&self) -> Result<Arc<dyn AccessTokenProvider>, AuthError> {
        let name = self.default_name()?;
        self.connection(name)
    }

    fn token_provider(
        &self,
        identity: &ClaimsIdentity,
        service_url: &str,
    ) -> Result<Arc<dyn AccessTokenProvider>, AuthError> {
        let audience = identity.audience();
        let name = self.resolve_name(audience, service_url)?;
        debug!(connection = name, audience, service_url, "resolved connection");
        self.connection(name)
    }

    fn credentials(&self) -> Vec<CredentialConfig> {
        self.connections
            .values()
            .map(|connection| connection.config.clone())
            .collect()
    }
}
