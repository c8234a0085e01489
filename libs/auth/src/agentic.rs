//! Token chain for agentic identities.
//!
//! An agent blueprint application mints an application token scoped to one
//! agent instance (`fmi_path`). That token is the client assertion for both the
//! instance token and the user token; the user token additionally presents the
//! instance token as the user federated identity credential.

use tracing::{Instrument, info_span};

use crate::error::AuthError;
use crate::provider::{ClientAuth, CredentialTokenProvider, TOKEN_EXCHANGE_RESOURCE, pairs};

fn exchange_scope() -> String {
    format!("{TOKEN_EXCHANGE_RESOURCE}/.default")
}

impl CredentialTokenProvider {
    pub(crate) async fn agentic_application_token(
        &self,
        tenant_id: Option<&str>,
        instance_id: &str,
    ) -> Result<String, AuthError> {
        let app_id = self.config().client_id();
        let endpoint = self.config().token_endpoint(tenant_id);
        let scope = exchange_scope();
        let params = pairs(&[
            ("grant_type", "client_credentials"),
            ("client_id", app_id),
            ("scope", scope.as_str()),
            ("fmi_path", instance_id),
        ]);
        self.exchange(
            "agentic_application",
            &endpoint,
            params,
            ClientAuth::Configured,
            None,
            false,
        )
        .instrument(info_span!("agentic_application_token", %app_id, %instance_id))
        .await
        .map_err(|err| AuthError::AgenticApplicationToken {
            app_id: app_id.to_string(),
            instance_id: instance_id.to_string(),
            reason: err.to_string(),
        })
    }

    pub(crate) async fn agentic_instance_token(
        &self,
        tenant_id: Option<&str>,
        instance_id: &str,
    ) -> Result<String, AuthError> {
        let application = self
            .agentic_application_token(tenant_id, instance_id)
            .await?;
        let endpoint = self.config().token_endpoint(tenant_id);
        let scope = exchange_scope();
        let params = pairs(&[
            ("grant_type", "client_credentials"),
            ("client_id", instance_id),
            ("scope", scope.as_str()),
        ]);
        self.exchange(
            "agentic_instance",
            &endpoint,
            params,
            ClientAuth::Assertion(application),
            None,
            false,
        )
        .instrument(info_span!("agentic_instance_token", %instance_id))
        .await
        .map_err(|err| AuthError::AgenticInstanceToken {
            instance_id: instance_id.to_string(),
            reason: err.to_string(),
        })
    }

    pub(crate) async fn agentic_user_token(
        &self,
        tenant_id: Option<&str>,
        instance_id: &str,
        user: &str,
        scopes: &[String],
    ) -> Result<String, AuthError> {
        let application = self
            .agentic_application_token(tenant_id, instance_id)
            .await?;
        let instance = self.agentic_instance_token(tenant_id, instance_id).await?;
        let endpoint = self.config().token_endpoint(tenant_id);
        let scope = scopes.join(" ");
        let mut params = pairs(&[
            ("grant_type", "user_fic"),
            ("client_id", instance_id),
            ("scope", scope.as_str()),
            ("username", user),
        ]);
        // Excluded from the cache key along with the assertion.
        params.push(("user_federated_identity_credential".into(), instance));
        self.exchange(
            "agentic_user",
            &endpoint,
            params,
            ClientAuth::Assertion(application),
            None,
            false,
        )
        .instrument(info_span!("agentic_user_token", %instance_id))
        .await
        .map_err(|err| AuthError::AgenticUserToken {
            instance_id: instance_id.to_string(),
            reason: err.to_string(),
        })
    }
}
