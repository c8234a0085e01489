use std::sync::Arc;

use agents_auth::{AgentsConfig, ConnectionManager, Environment, JwtVerifier, MockTokenTransport, StaticKeySource};
use agents_core::{ConnectorCall, MemoryStorage, Storage};
use agents_hosting::{CloudAdapter, MockConnectorFactory};
use axum::Router;
use axum::body::{Body, to_bytes};
use echo_agent::http::build_router;
use http::{Request, StatusCode, header};
use jsonwebtoken::jwk::JwkSet;
use serde_json::{Value, json};
use tower::ServiceExt;

fn app() -> (Router, Arc<MockConnectorFactory>) {
    let keys = Arc::new(StaticKeySource::new(JwkSet { keys: Vec::new() }));
    let verifier = JwtVerifier::new(Vec::new(), Environment::Development, keys);
    let connections =
        ConnectionManager::from_config(&AgentsConfig::default(), Arc::new(MockTokenTransport::new()))
            .unwrap();
    let factory = Arc::new(MockConnectorFactory::new());
    let adapter = CloudAdapter::new(Arc::new(verifier), Arc::new(connections), factory.clone());
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    (build_router(Arc::new(adapter), storage, String::new()), factory)
}

fn post(uri: &str, payload: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(&payload).unwrap()))
        .unwrap()
}

fn message(text: &str) -> Value {
    json!({
        "type": "message",
        "id": "in-1",
        "channelId": "msteams",
        "serviceUrl": "https://relay.example/",
        "from": { "id": "user-1" },
        "recipient": { "id": "echo", "role": "bot" },
        "conversation": { "id": "conv-1" },
        "text": text,
    })
}

fn texts(calls: &[ConnectorCall]) -> Vec<String> {
    calls
        .iter()
        .filter_map(|call| match call {
            ConnectorCall::SendToConversation { activity, .. }
            | ConnectorCall::ReplyToActivity { activity, .. } => activity.text.clone(),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn anonymous_message_is_echoed_through_the_relay() {
    let (app, factory) = app();

    let response = app.oneshot(post("/api/messages", message("hello"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let calls = factory.connector_client().recorded().await;
    assert_eq!(texts(&calls), ["Echo: hello"]);
    assert_eq!(
        factory.created(),
        vec![("https://relay.example/".to_string(), None)]
    );
}

#[tokio::test]
async fn notify_reaches_a_known_conversation() {
    let (app, factory) = app();

    let response = app
        .clone()
        .oneshot(post("/api/messages", message("hello")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(post(
            "/api/notify",
            json!({ "conversationId": "conv-1", "text": "build finished" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "sent");

    let calls = factory.connector_client().recorded().await;
    assert_eq!(texts(&calls), ["Echo: hello", "build finished"]);
}

#[tokio::test]
async fn notify_for_unknown_conversation_is_not_found() {
    let (app, factory) = app();

    let response = app
        .oneshot(post(
            "/api/notify",
            json!({ "conversationId": "missing", "text": "hi" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(factory.connector_client().recorded().await.is_empty());
}
