use std::sync::Arc;
use std::time::Duration;

use agents_core::activity::{activity_types, delivery_modes};
use agents_core::{
    Activity, ChannelAccount, ConnectorCall, ConnectorChannel, ConversationAccount,
    ConversationReference, DeleteActivityHook, DeleteNext, InvokeResponse, MockConnectorClient,
    ResourceResponse, SendActivitiesHook, SendNext, TurnContext, TurnError, TurnStateValue,
    UpdateActivityHook, UpdateNext,
};
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

fn inbound(channel: &str) -> Activity {
    let mut activity = Activity::message("hi");
    activity.id = Some("in-1".into());
    activity.channel_id = Some(channel.into());
    activity.service_url = Some("https://relay.example/".into());
    activity.from = Some(ChannelAccount::new("user-1"));
    activity.recipient = Some(ChannelAccount::new("agent-1"));
    activity.conversation = Some(ConversationAccount::new("conv-1"));
    activity
}

fn connected(activity: Activity) -> (TurnContext, Arc<MockConnectorClient>) {
    let connector = Arc::new(MockConnectorClient::new());
    let context = TurnContext::new(Arc::new(ConnectorChannel::new()), activity);
    context
        .push_turn_state(TurnStateValue::ConnectorClient(connector.clone()))
        .unwrap();
    (context, connector)
}

struct Tagging {
    tag: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl SendActivitiesHook for Tagging {
    async fn on_send(
        &self,
        _context: &TurnContext,
        mut activities: Vec<Activity>,
        next: SendNext<'_>,
    ) -> Result<Vec<ResourceResponse>, TurnError> {
        self.log.lock().await.push(self.tag.to_string());
        for activity in &mut activities {
            let text = activity.text.take().unwrap_or_default();
            activity.text = Some(format!("{text}+{}", self.tag));
        }
        next.run(activities).await
    }
}

struct Swallow;

#[async_trait]
impl SendActivitiesHook for Swallow {
    async fn on_send(
        &self,
        _context: &TurnContext,
        activities: Vec<Activity>,
        _next: SendNext<'_>,
    ) -> Result<Vec<ResourceResponse>, TurnError> {
        Ok(activities.iter().map(|_| ResourceResponse::default()).collect())
    }
}

struct Failing;

#[async_trait]
impl SendActivitiesHook for Failing {
    async fn on_send(
        &self,
        _context: &TurnContext,
        _activities: Vec<Activity>,
        _next: SendNext<'_>,
    ) -> Result<Vec<ResourceResponse>, TurnError> {
        Err(anyhow::anyhow!("hook rejected the send").into())
    }
}

#[tokio::test]
async fn send_hooks_run_in_order_before_dispatch() {
    let (context, connector) = connected(inbound("msteams"));
    let log = Arc::new(Mutex::new(Vec::new()));
    context
        .on_send_activities(Arc::new(Tagging { tag: "first", log: log.clone() }))
        .unwrap();
    context
        .on_send_activities(Arc::new(Tagging { tag: "second", log: log.clone() }))
        .unwrap();

    let response = context.send_text("pong").await.unwrap();
    assert_eq!(response.id, "activity-1");
    assert_eq!(*log.lock().await, vec!["first", "second"]);

    let calls = connector.recorded().await;
    match &calls[..] {
        [ConnectorCall::ReplyToActivity { conversation_id, activity_id, activity }] => {
            assert_eq!(conversation_id, "conv-1");
            assert_eq!(activity_id, "in-1");
            assert_eq!(activity.text.as_deref(), Some("pong+first+second"));
            assert_eq!(activity.from.as_ref().unwrap().id, "agent-1");
            assert_eq!(activity.recipient.as_ref().unwrap().id, "user-1");
        }
        other => panic!("unexpected calls: {other:?}"),
    }
    assert!(context.responded().unwrap());
}

#[tokio::test]
async fn hook_can_short_circuit_dispatch() {
    let (context, connector) = connected(inbound("msteams"));
    context.on_send_activities(Arc::new(Swallow)).unwrap();

    context.send_text("never delivered").await.unwrap();
    assert!(connector.recorded().await.is_empty());
    assert!(!context.responded().unwrap());
}

#[tokio::test]
async fn hook_errors_reject_the_send() {
    let (context, connector) = connected(inbound("msteams"));
    context.on_send_activities(Arc::new(Failing)).unwrap();

    let err = context.send_text("boom").await.unwrap_err();
    assert!(matches!(err, TurnError::Other(_)));
    assert!(err.to_string().contains("hook rejected"));
    assert!(connector.recorded().await.is_empty());
}

#[tokio::test]
async fn expect_replies_buffers_in_order_without_dispatch() {
    let mut activity = inbound("msteams");
    activity.delivery_mode = Some(delivery_modes::EXPECT_REPLIES.into());
    let (context, connector) = connected(activity);

    context.send_text("one").await.unwrap();
    context
        .send_activities(vec![Activity::message("two"), Activity::message("three")])
        .await
        .unwrap();
    context
        .send_activity(Activity::invoke_response(InvokeResponse::new(200, Some(json!({"ok": 1})))))
        .await
        .unwrap();

    let texts: Vec<_> = context
        .buffered_replies()
        .unwrap()
        .into_iter()
        .map(|activity| activity.text.unwrap_or_default())
        .collect();
    assert_eq!(texts, vec!["one", "two", "three"]);
    assert!(connector.recorded().await.is_empty());

    let outcome = context.revoke().expect("outcome");
    assert_eq!(outcome.buffered.len(), 3);
    assert_eq!(outcome.invoke_response.unwrap().body, Some(json!({"ok": 1})));
    assert!(outcome.responded);
}

#[tokio::test]
async fn trace_is_dropped_outside_emulator_and_does_not_respond() {
    let (context, connector) = connected(inbound("msteams"));
    context
        .send_trace_activity("diag", Some(json!({"step": 1})), None, None)
        .await
        .unwrap();
    assert!(connector.recorded().await.is_empty());
    assert!(!context.responded().unwrap());

    let (emulator, emulator_connector) = connected(inbound("emulator"));
    emulator
        .send_trace_activity("diag", None, None, None)
        .await
        .unwrap();
    assert_eq!(emulator_connector.recorded().await.len(), 1);
    assert!(!emulator.responded().unwrap());
}

#[tokio::test]
async fn invoke_response_is_stored_not_sent() {
    let mut activity = inbound("msteams");
    activity.r#type = activity_types::INVOKE.into();
    let (context, connector) = connected(activity);

    context
        .send_activity(Activity::invoke_response(InvokeResponse::new(202, None)))
        .await
        .unwrap();
    assert!(connector.recorded().await.is_empty());
    assert_eq!(context.invoke_response().unwrap().unwrap().status, 202);
}

#[tokio::test(start_paused = true)]
async fn delay_waits_for_requested_duration() {
    let (context, connector) = connected(inbound("msteams"));
    let mut delay = Activity::new(activity_types::DELAY);
    delay.value = Some(json!(250));

    let started = tokio::time::Instant::now();
    context
        .send_activities(vec![delay, Activity::message("after")])
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(250));
    assert_eq!(connector.recorded().await.len(), 1);
}

#[tokio::test]
async fn activities_without_reply_target_go_to_conversation() {
    let mut activity = inbound("msteams");
    activity.id = None;
    let (context, connector) = connected(activity);
    context.send_text("fresh").await.unwrap();
    assert!(matches!(
        &connector.recorded().await[..],
        [ConnectorCall::SendToConversation { conversation_id, .. }] if conversation_id == "conv-1"
    ));
}

struct Stamp;

#[async_trait]
impl UpdateActivityHook for Stamp {
    async fn on_update(
        &self,
        _context: &TurnContext,
        mut activity: Activity,
        next: UpdateNext<'_>,
    ) -> Result<ResourceResponse, TurnError> {
        activity.text = activity.text.map(|text| format!("{text} (edited)"));
        next.run(activity).await
    }
}

struct Observe(Arc<Mutex<Vec<ConversationReference>>>);

#[async_trait]
impl DeleteActivityHook for Observe {
    async fn on_delete(
        &self,
        _context: &TurnContext,
        reference: ConversationReference,
        next: DeleteNext<'_>,
    ) -> Result<(), TurnError> {
        self.0.lock().await.push(reference.clone());
        next.run(reference).await
    }
}

#[tokio::test]
async fn update_and_delete_route_through_their_chains() {
    let (context, connector) = connected(inbound("msteams"));
    let seen = Arc::new(Mutex::new(Vec::new()));
    context.on_update_activity(Arc::new(Stamp)).unwrap();
    context
        .on_delete_activity(Arc::new(Observe(seen.clone())))
        .unwrap();

    let mut update = Activity::message("draft");
    update.id = Some("out-7".into());
    context.update_activity(update).await.unwrap();
    context.delete_activity("out-7").await.unwrap();

    let calls = connector.recorded().await;
    assert!(matches!(
        &calls[0],
        ConnectorCall::UpdateActivity { activity_id, activity, .. }
            if activity_id == "out-7" && activity.text.as_deref() == Some("draft (edited)")
    ));
    assert!(matches!(
        &calls[1],
        ConnectorCall::DeleteActivity { conversation_id, activity_id }
            if conversation_id == "conv-1" && activity_id == "out-7"
    ));
    assert_eq!(seen.lock().await[0].activity_id.as_deref(), Some("out-7"));
}

#[tokio::test]
async fn nested_connector_shadows_and_restores() {
    let (context, outer) = connected(inbound("msteams"));
    let inner = Arc::new(MockConnectorClient::new());
    context
        .push_turn_state(TurnStateValue::ConnectorClient(inner.clone()))
        .unwrap();
    context.send_text("inner").await.unwrap();
    context
        .pop_turn_state(agents_core::TurnStateKey::ConnectorClient)
        .unwrap();
    context.send_text("outer").await.unwrap();

    assert_eq!(inner.recorded().await.len(), 1);
    assert_eq!(outer.recorded().await.len(), 1);
}
