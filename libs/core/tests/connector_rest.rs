use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use agents_core::activity::roles;
use agents_core::connector::USER_AGENT;
use agents_core::{
    Activity, ChannelAccount, ConnectorClient, ConnectorError, ConnectorOptions,
    ConversationAccount, ConversationReference, RestConnectorClient,
};
use axum::Router;
use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::IntoResponse;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
struct Captured {
    path: String,
    method: String,
    headers: HeaderMap,
    body: Value,
}

type Log = Arc<Mutex<Vec<Captured>>>;

// Skips when binding to localhost is not permitted in the current environment.
async fn relay(status: StatusCode) -> Option<(SocketAddr, Log, JoinHandle<()>)> {
    let listener = match TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("skipping connector test: {err}");
            return None;
        }
    };
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new().fallback({
        let log = log.clone();
        move |method: axum::http::Method, uri: Uri, headers: HeaderMap, body: Bytes| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(Captured {
                    path: uri.path().to_string(),
                    method: method.to_string(),
                    headers,
                    body: serde_json::from_slice(&body).unwrap_or(Value::Null),
                });
                if status.is_success() {
                    (status, axum::Json(json!({ "id": "activity-1" }))).into_response()
                } else {
                    (status, "relay says no").into_response()
                }
            }
        }
    });
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app.into_make_service()).await {
            eprintln!("relay mock server error: {err}");
        }
    });
    Some((addr, log, server))
}

fn reply(conversation_id: &str, from_role: &str) -> Activity {
    let mut activity = Activity::message("hello");
    activity.channel_id = Some("msteams".into());
    activity.from = Some(ChannelAccount::new("agent-1").with_role(from_role));
    activity.recipient = Some(ChannelAccount::new("user-1").with_role(roles::USER));
    activity.conversation = Some(ConversationAccount::new(conversation_id));
    activity
}

#[tokio::test]
async fn agentic_reply_truncates_long_conversation_id() {
    let Some((addr, log, server)) = relay(StatusCode::OK).await else {
        return;
    };
    let client = RestConnectorClient::new(
        reqwest::Client::new(),
        &format!("http://{addr}"),
        Some("token-1".into()),
    )
    .unwrap();

    let conversation_id = "a".repeat(350);
    let response = client
        .reply_to_activity(
            &conversation_id,
            "act-1",
            &reply(&conversation_id, roles::AGENTIC_USER),
        )
        .await
        .unwrap();
    assert_eq!(response.id, "activity-1");

    client
        .reply_to_activity(&conversation_id, "act-1", &reply(&conversation_id, roles::USER))
        .await
        .unwrap();

    let captured = log.lock().unwrap().clone();
    assert_eq!(captured.len(), 2);
    assert_eq!(
        captured[0].path,
        format!("/v3/conversations/{}/activities/act-1", "a".repeat(150))
    );
    assert_eq!(
        captured[1].path,
        format!("/v3/conversations/{conversation_id}/activities/act-1")
    );
    assert_eq!(captured[0].method, "POST");
    assert_eq!(
        captured[0].headers.get("authorization").unwrap(),
        "Bearer token-1"
    );
    assert_eq!(captured[0].headers.get("user-agent").unwrap(), USER_AGENT);

    server.abort();
}

#[tokio::test]
async fn regional_service_url_keeps_its_path_segment() {
    let Some((addr, log, server)) = relay(StatusCode::OK).await else {
        return;
    };
    let client =
        RestConnectorClient::new(reqwest::Client::new(), &format!("http://{addr}/amer"), None)
            .unwrap();

    let activity = reply("conv-1", roles::AGENT);
    client.send_to_conversation("conv-1", &activity).await.unwrap();
    client.reply_to_activity("conv-1", "act-1", &activity).await.unwrap();
    client.delete_activity("conv-1", "act-1").await.unwrap();

    let paths: Vec<_> = log.lock().unwrap().iter().map(|c| c.path.clone()).collect();
    assert_eq!(
        paths,
        [
            "/amer/v3/conversations/conv-1/activities",
            "/amer/v3/conversations/conv-1/activities/act-1",
            "/amer/v3/conversations/conv-1/activities/act-1",
        ]
    );

    server.abort();
}

#[tokio::test]
async fn configured_maximum_applies_to_agentic_sends() {
    let Some((addr, log, server)) = relay(StatusCode::OK).await else {
        return;
    };
    let client = RestConnectorClient::new(reqwest::Client::new(), &format!("http://{addr}/"), None)
        .unwrap()
        .with_options(ConnectorOptions::from_setting(Some("40")));

    let conversation_id = "b".repeat(90);
    client
        .send_to_conversation(
            &conversation_id,
            &reply(&conversation_id, roles::AGENTIC_INSTANCE),
        )
        .await
        .unwrap();

    let captured = log.lock().unwrap().clone();
    assert_eq!(
        captured[0].path,
        format!("/v3/conversations/{}/activities", "b".repeat(40))
    );
    assert!(captured[0].headers.get("authorization").is_none());

    server.abort();
}

#[tokio::test]
async fn outgoing_payload_uses_wire_field_names() {
    let Some((addr, log, server)) = relay(StatusCode::OK).await else {
        return;
    };
    let client =
        RestConnectorClient::new(reqwest::Client::new(), &format!("http://{addr}"), None).unwrap();

    let mut activity = reply("conv-1", roles::AGENT);
    activity.relates_to = Some(ConversationReference {
        agent: Some(ChannelAccount::new("agent-1")),
        conversation: Some(ConversationAccount::new("conv-0")),
        ..ConversationReference::default()
    });
    client.send_to_conversation("conv-1", &activity).await.unwrap();

    let captured = log.lock().unwrap().clone();
    let body = &captured[0].body;
    assert_eq!(body["relatesTo"]["bot"]["id"], "agent-1");
    assert!(body["relatesTo"].get("agent").is_none());
    assert_eq!(body["text"], "hello");

    server.abort();
}

#[tokio::test]
async fn remote_failures_carry_status_and_body() {
    let Some((addr, _log, server)) = relay(StatusCode::FORBIDDEN).await else {
        return;
    };
    let client =
        RestConnectorClient::new(reqwest::Client::new(), &format!("http://{addr}"), None).unwrap();

    let err = client.delete_activity("conv-1", "act-1").await.unwrap_err();
    match err {
        ConnectorError::Remote { status, message } => {
            assert_eq!(status, StatusCode::FORBIDDEN);
            assert_eq!(message, "relay says no");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    server.abort();
}
