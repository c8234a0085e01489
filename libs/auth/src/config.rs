//! Typed host configuration.
//!
//! Sources (a JSON/YAML file, process environment, or an in-code value) are
//! merged into one JSON tree and deserialized into [`AgentsConfig`], which is
//! validated before it is handed out. Environment variables use nested
//! double-underscore paths such as
//! `connections__serviceConnection__settings__clientId` or
//! `connectionsMap__0__serviceUrl`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use agents_core::connector::ConnectorOptions;
use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::AuthError;

pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";
pub const COMMON_TENANT: &str = "common";
pub const DEFAULT_CONNECTION: &str = "serviceConnection";
pub const WILDCARD: &str = "*";
/// Issuer of tokens minted by the relay itself.
pub const RELAY_ISSUER: &str = "https://api.botframework.com";

const ENV_ROOTS: &[&str] = &["connections", "connectionsMap", "agents"];
const ENV_SEPARATOR: &str = "__";

/// How a connection obtains its tokens. Exactly one applies per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    FederatedIdentity,
    ClientSecret,
    Certificate,
    ManagedIdentity,
}

impl CredentialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKind::FederatedIdentity => "federated_identity",
            CredentialKind::ClientSecret => "client_secret",
            CredentialKind::Certificate => "certificate",
            CredentialKind::ManagedIdentity => "managed_identity",
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_pem_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_key_file: Option<String>,
    #[serde(rename = "FICClientId", default, skip_serializing_if = "Option::is_none")]
    pub fic_client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authority: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issuers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(rename = "sendX5C", default, deserialize_with = "flexible_bool")]
    pub send_x5c: bool,
}

fn present(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

impl CredentialConfig {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    pub fn with_certificate(mut self, pem_file: impl Into<String>, key_file: impl Into<String>) -> Self {
        self.cert_pem_file = Some(pem_file.into());
        self.cert_key_file = Some(key_file.into());
        self
    }

    pub fn with_fic_client_id(mut self, fic_client_id: impl Into<String>) -> Self {
        self.fic_client_id = Some(fic_client_id.into());
        self
    }

    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = Some(authority.into());
        self
    }

    pub fn with_issuers(mut self, issuers: Vec<String>) -> Self {
        self.issuers = issuers;
        self
    }

    pub fn with_send_x5c(mut self, send_x5c: bool) -> Self {
        self.send_x5c = send_x5c;
        self
    }

    pub fn client_id(&self) -> &str {
        self.client_id.trim()
    }

    pub fn client_secret(&self) -> Option<&str> {
        present(&self.client_secret)
    }

    pub fn fic_client_id(&self) -> Option<&str> {
        present(&self.fic_client_id)
    }

    pub fn certificate_files(&self) -> Option<(&str, &str)> {
        present(&self.cert_pem_file).zip(present(&self.cert_key_file))
    }

    pub fn tenant(&self) -> &str {
        present(&self.tenant_id).unwrap_or(COMMON_TENANT)
    }

    pub fn authority(&self) -> &str {
        present(&self.authority)
            .unwrap_or(DEFAULT_AUTHORITY)
            .trim_end_matches('/')
    }

    /// Decides the acquisition mechanism. Conflicting or incomplete credential
    /// fields are a configuration error.
    pub fn credential_kind(&self) -> Result<CredentialKind, AuthError> {
        if self.client_id().is_empty() {
            return Err(AuthError::InvalidConfiguration("clientId is required".into()));
        }
        let pem = present(&self.cert_pem_file);
        let key = present(&self.cert_key_file);
        if pem.is_some() != key.is_some() {
            return Err(AuthError::InvalidConfiguration(
                "certPemFile and certKeyFile must be set together".into(),
            ));
        }
        let secret = self.client_secret().is_some();
        let certificate = pem.is_some();
        let federated = self.fic_client_id().is_some();
        let configured = [secret, certificate, federated]
            .into_iter()
            .filter(|set| *set)
            .count();
        if configured > 1 {
            return Err(AuthError::InvalidConfiguration(
                "clientSecret, certificate and FICClientId are mutually exclusive".into(),
            ));
        }
        Ok(if federated {
            CredentialKind::FederatedIdentity
        } else if secret {
            CredentialKind::ClientSecret
        } else if certificate {
            CredentialKind::Certificate
        } else {
            CredentialKind::ManagedIdentity
        })
    }

    /// Tenant used for a token request. A specific tenant supplied by the
    /// caller replaces the multi-tenant placeholder, never a configured tenant.
    pub fn resolve_tenant<'a>(&'a self, requested: Option<&'a str>) -> &'a str {
        let configured = self.tenant();
        match requested.map(str::trim).filter(|tenant| !tenant.is_empty()) {
            Some(requested) if configured.eq_ignore_ascii_case(COMMON_TENANT) => requested,
            _ => configured,
        }
    }

    pub fn token_endpoint(&self, requested_tenant: Option<&str>) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority(),
            self.resolve_tenant(requested_tenant)
        )
    }

    /// Accepted token issuers; defaults cover the relay and this tenant.
    pub fn issuers(&self) -> Vec<String> {
        if !self.issuers.is_empty() {
            return self.issuers.clone();
        }
        let tenant = self.tenant();
        vec![
            RELAY_ISSUER.to_string(),
            format!("https://sts.windows.net/{tenant}/"),
            format!("{DEFAULT_AUTHORITY}/{tenant}/v2.0"),
        ]
    }
}

impl fmt::Debug for CredentialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialConfig")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("cert_pem_file", &self.cert_pem_file)
            .field("cert_key_file", &self.cert_key_file)
            .field("fic_client_id", &self.fic_client_id)
            .field("authority", &self.authority)
            .field("issuers", &self.issuers)
            .field("scope", &self.scope)
            .field("send_x5c", &self.send_x5c)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConnectionSettings {
    #[serde(default)]
    pub settings: CredentialConfig,
}

/// One ordered routing rule of the connection map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMapEntry {
    #[serde(default = "wildcard")]
    pub service_url: String,
    /// Required; an entry matches only this exact audience.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    pub connection: String,
}

fn wildcard() -> String {
    WILDCARD.to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Environment {
    #[default]
    Production,
    Development,
}

impl From<String> for Environment {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" | "local" => Environment::Development,
            _ => Environment::Production,
        }
    }
}

impl From<Environment> for String {
    fn from(value: Environment) -> Self {
        match value {
            Environment::Production => "Production".into(),
            Environment::Development => "Development".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostSettings {
    #[serde(default)]
    pub environment: Environment,
    /// Kept raw; invalid values fall back to the default when applied.
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_conversation_id_length: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentsConfig {
    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionSettings>,
    #[serde(default)]
    pub connections_map: Vec<ConnectionMapEntry>,
    #[serde(default)]
    pub agents: HostSettings,
}

impl AgentsConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        Self::from_value(env_tree(vars))
    }

    /// Reads a JSON or YAML file (chosen by extension, YAML otherwise).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_value(read_file_tree(path.as_ref())?)
    }

    /// File values first, environment variables layered on top.
    pub fn load<I, K, V>(file: Option<&Path>, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut tree = match file {
            Some(path) => read_file_tree(path)?,
            None => Value::Object(Map::new()),
        };
        merge(&mut tree, env_tree(vars));
        Self::from_value(tree)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let config: AgentsConfig =
            serde_json::from_value(value).context("agents configuration has an invalid shape")?;
        config
            .validate()
            .context("agents configuration failed validation")?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AuthError> {
        for (name, connection) in &self.connections {
            connection.settings.credential_kind().map_err(|err| {
                AuthError::InvalidConfiguration(format!("connection `{name}`: {err}"))
            })?;
        }
        for (index, entry) in self.connections_map.iter().enumerate() {
            if entry.audience.as_deref().map(str::trim).unwrap_or_default().is_empty() {
                return Err(AuthError::InvalidConfiguration(format!(
                    "connectionsMap[{index}] has no audience"
                )));
            }
            if !self.connections.contains_key(&entry.connection) {
                return Err(AuthError::InvalidConfiguration(format!(
                    "connectionsMap[{index}] references unknown connection `{}`",
                    entry.connection
                )));
            }
        }
        Ok(())
    }

    pub fn is_production(&self) -> bool {
        self.agents.environment == Environment::Production
    }

    pub fn connector_options(&self) -> ConnectorOptions {
        ConnectorOptions::from_setting(self.agents.max_conversation_id_length.as_deref())
    }
}

fn read_file_tree(path: &Path) -> Result<Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration file {}", path.display()))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if is_json {
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid JSON in {}", path.display()))
    } else {
        serde_yaml::from_str(&raw).with_context(|| format!("invalid YAML in {}", path.display()))
    }
}

/// Turns `a__b__0__c=value` variables under the known roots into a JSON tree.
/// Objects whose keys are all indices become arrays.
pub fn env_tree<I, K, V>(vars: I) -> Value
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<String>,
{
    let mut root = Map::new();
    for (key, value) in vars {
        let mut segments = key.as_ref().split(ENV_SEPARATOR);
        let Some(first) = segments.next() else {
            continue;
        };
        let Some(root_name) = ENV_ROOTS
            .iter()
            .find(|candidate| candidate.eq_ignore_ascii_case(first))
        else {
            continue;
        };
        let mut path = vec![*root_name];
        path.extend(segments.filter(|segment| !segment.is_empty()));
        if path.len() < 2 {
            continue;
        }
        insert_path(&mut root, &path, Value::String(value.into()));
    }
    arrayify(Value::Object(root))
}

fn insert_path(node: &mut Map<String, Value>, path: &[&str], value: Value) {
    match path {
        [] => {}
        [last] => {
            node.insert(last.to_string(), value);
        }
        [head, rest @ ..] => {
            let child = node
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(child) = child {
                insert_path(child, rest, value);
            }
        }
    }
}

fn arrayify(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let all_indices = !map.is_empty() && map.keys().all(|key| key.parse::<usize>().is_ok());
            if all_indices {
                let mut items: Vec<(usize, Value)> = map
                    .into_iter()
                    .filter_map(|(key, value)| key.parse::<usize>().ok().map(|idx| (idx, arrayify(value))))
                    .collect();
                items.sort_by_key(|(index, _)| *index);
                Value::Array(items.into_iter().map(|(_, value)| value).collect())
            } else {
                Value::Object(
                    map.into_iter()
                        .map(|(key, value)| (key, arrayify(value)))
                        .collect(),
                )
            }
        }
        other => other,
    }
}

fn merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_obj), Value::Object(src_obj)) => {
            for (key, value) in src_obj {
                match dst_obj.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        dst_obj.insert(key, value);
                    }
                }
            }
        }
        (dst, src) => *dst = src,
    }
}

fn flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Bool(flag)) => flag,
        Some(Value::String(raw)) => matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes"
        ),
        Some(Value::Number(number)) => number.as_u64().map(|n| n != 0).unwrap_or(false),
        _ => false,
    })
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(raw)) => Some(raw),
        Some(Value::Number(number)) => Some(number.to_string()),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    })
}
