//! The per-turn protocol between the relay and an agent.
//!
//! An inbound request is parsed, authenticated, given relay clients and run
//! through the middleware pipeline inside a revocable [`TurnContext`]. The
//! outcome of the released turn decides the HTTP response. Proactive turns
//! (continuations and created conversations) share the same pipeline.

use std::sync::Arc;
use std::time::Instant;

use agents_auth::{
    AccessTokenProvider, AgentsConfig, ConnectionManager, Connections, HttpSigningKeySource,
    JwtVerifier, ReqwestTokenTransport, TokenVerifier,
};
use agents_core::activity::roles;
use agents_core::identity::RELAY_SCOPE;
use agents_core::{
    Activity, ActivityHandler, ChannelAdapter, ChannelAccount, ClaimsIdentity, ConnectorChannel,
    ConversationAccount, ConversationParameters, ConversationReference, ExpectedReplies,
    InvokeResponse, Middleware, MiddlewareSet, RevocationGuard, TurnContext, TurnOutcome,
    TurnStateValue, normalize_incoming, normalize_outgoing,
};
use anyhow::Context as _;
use axum::Json;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{Instrument, debug, info_span, warn};

use crate::error::AdapterError;
use crate::factory::{ConnectorFactory, RestConnectorFactory};
use crate::turn_error::{DefaultTurnErrorHandler, TurnErrorHandler};

/// Raw inbound HTTP request as handed over by the web layer.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    pub authorization: Option<String>,
    pub body: Vec<u8>,
}

impl InboundRequest {
    pub fn new(authorization: Option<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            authorization,
            body: body.into(),
        }
    }
}

/// HTTP status and optional JSON body produced by a turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnResponse {
    pub status: StatusCode,
    pub body: Option<Value>,
}

impl TurnResponse {
    pub fn empty(status: StatusCode) -> Self {
        Self { status, body: None }
    }

    fn from_outcome(activity: &Activity, outcome: TurnOutcome) -> Self {
        if activity.is_expect_replies() {
            let status = outcome
                .invoke_response
                .as_ref()
                .map(|response| invoke_status(response.status))
                .unwrap_or(StatusCode::OK);
            let replies = ExpectedReplies {
                activities: outcome
                    .buffered
                    .into_iter()
                    .map(|activity| normalize_outgoing(to_json(&activity)))
                    .collect(),
                body: outcome.invoke_response.and_then(|response| response.body),
            };
            return Self {
                status,
                body: Some(to_json(&replies)),
            };
        }
        if activity.is_invoke() {
            return match outcome.invoke_response {
                Some(InvokeResponse { status, body }) => Self {
                    status: invoke_status(status),
                    body,
                },
                None => Self::empty(StatusCode::NOT_IMPLEMENTED),
            };
        }
        Self::empty(StatusCode::OK)
    }
}

impl IntoResponse for TurnResponse {
    fn into_response(self) -> Response {
        match self.body {
            Some(body) => (self.status, Json(body)).into_response(),
            None => self.status.into_response(),
        }
    }
}

fn invoke_status(status: u16) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn to_json<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Hosts agents behind the relay's HTTP turn protocol.
pub struct CloudAdapter {
    verifier: Arc<dyn TokenVerifier>,
    connections: Arc<dyn Connections>,
    factory: Arc<dyn ConnectorFactory>,
    channel: Arc<dyn ChannelAdapter>,
    middleware: MiddlewareSet,
    on_turn_error: Arc<dyn TurnErrorHandler>,
}

impl CloudAdapter {
    pub fn new(
        verifier: Arc<dyn TokenVerifier>,
        connections: Arc<dyn Connections>,
        factory: Arc<dyn ConnectorFactory>,
    ) -> Self {
        Self {
            verifier,
            connections,
            factory,
            channel: Arc::new(ConnectorChannel::new()),
            middleware: MiddlewareSet::new(),
            on_turn_error: Arc::new(DefaultTurnErrorHandler),
        }
    }

    /// Production wiring: reqwest transports, HTTP key discovery and REST
    /// relay clients sharing one connection pool.
    pub fn from_config(config: &AgentsConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::new();
        let transport = Arc::new(ReqwestTokenTransport::new(client.clone()));
        let connections = ConnectionManager::from_config(config, transport)
            .context("failed to build connections")?;
        let keys = Arc::new(HttpSigningKeySource::new(client.clone()));
        let verifier = JwtVerifier::from_config(config, keys);
        let factory = RestConnectorFactory::new(client, config.connector_options());
        Ok(Self::new(
            Arc::new(verifier),
            Arc::new(connections),
            Arc::new(factory),
        ))
    }

    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn with_turn_error_handler(mut self, handler: Arc<dyn TurnErrorHandler>) -> Self {
        self.on_turn_error = handler;
        self
    }

    pub fn with_channel(mut self, channel: Arc<dyn ChannelAdapter>) -> Self {
        self.channel = channel;
        self
    }

    /// Runs one inbound turn and maps its outcome onto an HTTP response.
    pub async fn process(
        &self,
        request: InboundRequest,
        handler: &dyn ActivityHandler,
    ) -> Result<TurnResponse, AdapterError> {
        let activity = parse_activity(&request.body)?;
        let span = info_span!(
            "turn",
            activity_type = %activity.r#type,
            channel = activity.channel_id.as_deref().unwrap_or_default(),
            conversation = activity.conversation_id().unwrap_or_default(),
        );
        async {
            let identity = self
                .verifier
                .verify(request.authorization.as_deref())
                .await?;
            let needs_connector = !(activity.is_expect_replies() && activity.service_url.is_none());
            let outcome = self
                .run_turn(identity, activity.clone(), handler, needs_connector)
                .await?;
            Ok::<_, AdapterError>(TurnResponse::from_outcome(&activity, outcome))
        }
        .instrument(span)
        .await
    }

    /// Proactively resumes a conversation from a stored reference.
    pub async fn continue_conversation(
        &self,
        identity: ClaimsIdentity,
        reference: &ConversationReference,
        handler: &dyn ActivityHandler,
    ) -> Result<(), AdapterError> {
        reference
            .validate()
            .map_err(|err| AdapterError::InvalidActivity(err.to_string()))?;
        let activity = reference.continuation_activity();
        self.run_turn(identity, activity, handler, true)
            .instrument(info_span!(
                "continue_conversation",
                conversation = reference.conversation_id().unwrap_or_default()
            ))
            .await
            .map(|_| ())
    }

    /// Continuation on behalf of the agent application `app_id`.
    pub async fn continue_conversation_as(
        &self,
        app_id: &str,
        reference: &ConversationReference,
        handler: &dyn ActivityHandler,
    ) -> Result<(), AdapterError> {
        self.continue_conversation(ClaimsIdentity::for_agent(app_id), reference, handler)
            .await
    }

    /// Creates a conversation through the relay, then runs a turn in it.
    pub async fn create_conversation(
        &self,
        app_id: &str,
        channel_id: &str,
        service_url: &str,
        parameters: ConversationParameters,
        handler: &dyn ActivityHandler,
    ) -> Result<ConversationReference, AdapterError> {
        let identity = ClaimsIdentity::for_agent(app_id);
        let provider = self.connections.token_provider(&identity, service_url)?;
        let token = provider
            .get_access_token(&identity.outgoing_scope(), false)
            .await?;
        let connector = self.factory.connector(service_url, Some(token))?;
        let created = connector.create_conversation(&parameters).await?;
        debug!(conversation = %created.id, "created conversation");

        let mut conversation = ConversationAccount::new(created.id);
        conversation.tenant_id = parameters.tenant_id.clone();
        let reference = ConversationReference {
            activity_id: created.activity_id,
            user: parameters.members.first().cloned(),
            agent: parameters
                .agent
                .clone()
                .or_else(|| Some(ChannelAccount::new(app_id).with_role(roles::AGENT))),
            conversation: Some(conversation),
            channel_id: Some(channel_id.to_string()),
            locale: None,
            service_url: Some(created.service_url.unwrap_or_else(|| service_url.to_string())),
        };
        let activity = reference.creation_activity();
        self.run_turn(identity, activity, handler, true).await?;
        Ok(reference)
    }

    async fn run_turn(
        &self,
        identity: ClaimsIdentity,
        activity: Activity,
        handler: &dyn ActivityHandler,
        needs_connector: bool,
    ) -> Result<TurnOutcome, AdapterError> {
        let started = Instant::now();
        let context = TurnContext::new(self.channel.clone(), activity);
        let guard = RevocationGuard::new(context);
        guard
            .context()
            .push_turn_state(TurnStateValue::Identity(identity.clone()))?;
        if needs_connector {
            self.attach_clients(guard.context(), &identity).await?;
        }

        let result = self.middleware.run(guard.context(), Some(handler)).await;
        let label = match &result {
            Ok(()) => "ok",
            Err(err) => {
                self.on_turn_error.on_turn_error(guard.context(), err).await;
                "error"
            }
        };
        let outcome = guard.finish().unwrap_or_default();
        counter!("agents_turns_total", "outcome" => label).increment(1);
        histogram!("agents_turn_duration_seconds").record(started.elapsed().as_secs_f64());
        Ok(outcome)
    }

    /// Resolves the connection for the caller and stores relay clients in the
    /// turn state.
    async fn attach_clients(
        &self,
        context: &TurnContext,
        identity: &ClaimsIdentity,
    ) -> Result<(), AdapterError> {
        let activity = context.activity()?;
        let service_url = activity
            .service_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| AdapterError::InvalidActivity("serviceUrl is required".into()))?;

        if identity.is_anonymous() {
            debug!("anonymous caller; relay clients carry no token");
            let connector = self.factory.connector(service_url, None)?;
            let user_tokens = self.factory.user_token_client("", None)?;
            context.push_turn_state(TurnStateValue::ConnectorClient(connector))?;
            context.push_turn_state(TurnStateValue::UserTokenClient(user_tokens))?;
            return Ok(());
        }

        let provider = self
            .connections
            .token_provider_for_activity(identity, activity)?;
        let (scope, token) = connector_token(provider.as_ref(), identity, activity).await?;
        let user_token = if activity.is_agentic_request() {
            token.clone()
        } else {
            provider.get_access_token(RELAY_SCOPE, false).await?
        };
        let connector = self.factory.connector(service_url, Some(token))?;
        let user_tokens = self
            .factory
            .user_token_client(provider.client_id(), Some(user_token))?;
        context.push_turn_state(TurnStateValue::ConnectorClient(connector))?;
        context.push_turn_state(TurnStateValue::UserTokenClient(user_tokens))?;
        context.push_turn_state(TurnStateValue::OAuthScope(scope))?;
        Ok(())
    }
}

/// Token for relay calls. Agentic recipients act through their instance or
/// user identity; everyone else uses the scope derived from the caller.
async fn connector_token(
    provider: &dyn AccessTokenProvider,
    identity: &ClaimsIdentity,
    activity: &Activity,
) -> Result<(String, String), AdapterError> {
    let role = activity
        .recipient
        .as_ref()
        .and_then(|recipient| recipient.role.as_deref())
        .unwrap_or_default();
    let tenant = activity.agentic_tenant_id();
    if activity.is_agentic_request() {
        let instance = activity.agentic_instance_id().ok_or_else(|| {
            AdapterError::InvalidActivity("agentic recipient has no agenticAppId".into())
        })?;
        if role.eq_ignore_ascii_case(roles::AGENTIC_USER) {
            let user = activity.agentic_user().ok_or_else(|| {
                AdapterError::InvalidActivity("agentic user recipient has no agenticUserId".into())
            })?;
            let scope = format!("{RELAY_SCOPE}/.default");
            let token = provider
                .get_agentic_user_token(tenant, instance, user, std::slice::from_ref(&scope))
                .await?;
            return Ok((scope, token));
        }
        let token = provider.get_agentic_instance_token(tenant, instance).await?;
        return Ok((RELAY_SCOPE.to_string(), token));
    }
    let scope = identity.outgoing_scope();
    let token = provider.get_access_token(&scope, false).await?;
    Ok((scope, token))
}

fn parse_activity(body: &[u8]) -> Result<Activity, AdapterError> {
    let payload: Value = serde_json::from_slice(body)
        .map_err(|err| AdapterError::InvalidActivity(format!("body is not valid json: {err}")))?;
    let activity: Activity = serde_json::from_value(normalize_incoming(payload))
        .map_err(|err| AdapterError::InvalidActivity(err.to_string()))?;
    activity.validate().map_err(|err| {
        warn!(error = %err, "rejecting inbound activity");
        AdapterError::InvalidActivity(err.to_string())
    })?;
    Ok(activity)
}
