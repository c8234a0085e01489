//! Per-turn construction of relay clients.

use std::sync::{Arc, Mutex, PoisonError};

use agents_core::connector::ConnectorOptions;
use agents_core::user_token::DEFAULT_TOKEN_SERVICE_URL;
use agents_core::{
    ConnectorClient, ConnectorError, MockConnectorClient, RestConnectorClient, RestUserTokenClient,
    UserTokenClient,
};
use reqwest::Client;

pub trait ConnectorFactory: Send + Sync {
    /// Connector for `service_url`. `token` is `None` for anonymous traffic.
    fn connector(
        &self,
        service_url: &str,
        token: Option<String>,
    ) -> Result<Arc<dyn ConnectorClient>, ConnectorError>;

    fn user_token_client(
        &self,
        app_id: &str,
        token: Option<String>,
    ) -> Result<Arc<dyn UserTokenClient>, ConnectorError>;
}

/// Builds REST clients sharing one HTTP connection pool.
#[derive(Clone)]
pub struct RestConnectorFactory {
    client: Client,
    options: ConnectorOptions,
    token_service_url: String,
}

impl RestConnectorFactory {
    pub fn new(client: Client, options: ConnectorOptions) -> Self {
        Self {
            client,
            options,
            token_service_url: DEFAULT_TOKEN_SERVICE_URL.to_string(),
        }
    }

    pub fn with_token_service_url(mut self, url: impl Into<String>) -> Self {
        self.token_service_url = url.into();
        self
    }
}

impl ConnectorFactory for RestConnectorFactory {
    fn connector(
        &self,
        service_url: &str,
        token: Option<String>,
    ) -> Result<Arc<dyn ConnectorClient>, ConnectorError> {
        let client = RestConnectorClient::new(self.client.clone(), service_url, token)?
            .with_options(self.options);
        Ok(Arc::new(client))
    }

    fn user_token_client(
        &self,
        app_id: &str,
        token: Option<String>,
    ) -> Result<Arc<dyn UserTokenClient>, ConnectorError> {
        let client =
            RestUserTokenClient::new(self.client.clone(), &self.token_service_url, app_id, token)?;
        Ok(Arc::new(client))
    }
}

/// Hands out one shared [`MockConnectorClient`] and records the credentials
/// each connector was created with.
#[derive(Default)]
pub struct MockConnectorFactory {
    connector: Arc<MockConnectorClient>,
    created: Mutex<Vec<(String, Option<String>)>>,
}

impl MockConnectorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector_client(&self) -> Arc<MockConnectorClient> {
        self.connector.clone()
    }

    /// `(service_url, token)` per created connector.
    pub fn created(&self) -> Vec<(String, Option<String>)> {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ConnectorFactory for MockConnectorFactory {
    fn connector(
        &self,
        service_url: &str,
        token: Option<String>,
    ) -> Result<Arc<dyn ConnectorClient>, ConnectorError> {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((service_url.to_string(), token));
        Ok(self.connector.clone())
    }

    fn user_token_client(
        &self,
        app_id: &str,
        token: Option<String>,
    ) -> Result<Arc<dyn UserTokenClient>, ConnectorError> {
        let client = RestUserTokenClient::new(Client::new(), DEFAULT_TOKEN_SERVICE_URL, app_id, token)?;
        Ok(Arc::new(client))
    }
}
