use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tracing::debug;

use crate::activity::{Activity, InvokeResponse, ResourceResponse, activity_types};
use crate::adapter::ChannelAdapter;
use crate::connector::ConnectorClient;
use crate::error::TurnError;
use crate::hooks::{
    DeleteActivityHook, DeleteNext, SendActivitiesHook, SendNext, UpdateActivityHook, UpdateNext,
};
use crate::identity::ClaimsIdentity;
use crate::reference::ConversationReference;
use crate::turn_state::{TurnState, TurnStateKey, TurnStateValue};
use crate::user_token::UserTokenClient;

/// What a turn left behind once its context was released.
#[derive(Debug, Clone, Default)]
pub struct TurnOutcome {
    /// Replies captured in `expectReplies` mode, in send order.
    pub buffered: Vec<Activity>,
    pub invoke_response: Option<InvokeResponse>,
    pub responded: bool,
}

struct Inner {
    adapter: Arc<dyn ChannelAdapter>,
    activity: Activity,
    state: Mutex<TurnState>,
    responded: AtomicBool,
    buffered: Mutex<Vec<Activity>>,
    send_hooks: Mutex<Vec<Arc<dyn SendActivitiesHook>>>,
    update_hooks: Mutex<Vec<Arc<dyn UpdateActivityHook>>>,
    delete_hooks: Mutex<Vec<Arc<dyn DeleteActivityHook>>>,
    revoked: AtomicBool,
}

/// Handle to the state of one turn. Clones share the same turn; once the turn
/// is revoked every operation fails with [`TurnError::ContextRevoked`].
#[derive(Clone)]
pub struct TurnContext {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TurnContext {
    pub fn new(adapter: Arc<dyn ChannelAdapter>, activity: Activity) -> Self {
        Self {
            inner: Arc::new(Inner {
                adapter,
                activity,
                state: Mutex::new(TurnState::new()),
                responded: AtomicBool::new(false),
                buffered: Mutex::new(Vec::new()),
                send_hooks: Mutex::new(Vec::new()),
                update_hooks: Mutex::new(Vec::new()),
                delete_hooks: Mutex::new(Vec::new()),
                revoked: AtomicBool::new(false),
            }),
        }
    }

    fn ensure_active(&self) -> Result<(), TurnError> {
        if self.inner.revoked.load(Ordering::Acquire) {
            Err(TurnError::ContextRevoked)
        } else {
            Ok(())
        }
    }

    pub fn is_revoked(&self) -> bool {
        self.inner.revoked.load(Ordering::Acquire)
    }

    pub fn activity(&self) -> Result<&Activity, TurnError> {
        self.ensure_active()?;
        Ok(&self.inner.activity)
    }

    pub fn responded(&self) -> Result<bool, TurnError> {
        self.ensure_active()?;
        Ok(self.inner.responded.load(Ordering::Acquire))
    }

    /// `responded` only moves from false to true; resetting it is rejected
    /// and the flag keeps its value.
    pub fn set_responded(&self, responded: bool) -> Result<(), TurnError> {
        self.ensure_active()?;
        if responded {
            self.inner.responded.store(true, Ordering::Release);
            return Ok(());
        }
        if self.inner.responded.load(Ordering::Acquire) {
            return Err(TurnError::RespondedReset);
        }
        Ok(())
    }

    pub fn with_turn_state<R>(&self, f: impl FnOnce(&mut TurnState) -> R) -> Result<R, TurnError> {
        self.ensure_active()?;
        let mut state = lock(&self.inner.state);
        Ok(f(&mut state))
    }

    pub fn push_turn_state(&self, value: TurnStateValue) -> Result<(), TurnError> {
        self.with_turn_state(|state| state.push(value))
    }

    pub fn pop_turn_state(&self, key: TurnStateKey) -> Result<Option<TurnStateValue>, TurnError> {
        self.with_turn_state(|state| state.pop(key))
    }

    pub fn set_turn_state(&self, value: TurnStateValue) -> Result<(), TurnError> {
        self.with_turn_state(|state| state.set(value))
    }

    pub fn identity(&self) -> Result<Option<ClaimsIdentity>, TurnError> {
        self.with_turn_state(|state| state.identity().cloned())
    }

    pub fn connector_client(&self) -> Result<Arc<dyn ConnectorClient>, TurnError> {
        self.with_turn_state(|state| state.connector_client())?
            .ok_or(TurnError::MissingConnectorClient)
    }

    pub fn user_token_client(&self) -> Result<Option<Arc<dyn UserTokenClient>>, TurnError> {
        self.with_turn_state(|state| state.user_token_client())
    }

    pub fn invoke_response(&self) -> Result<Option<InvokeResponse>, TurnError> {
        self.with_turn_state(|state| state.invoke_response().map(InvokeResponse::from_activity))
    }

    pub fn on_send_activities(&self, hook: Arc<dyn SendActivitiesHook>) -> Result<(), TurnError> {
        self.ensure_active()?;
        lock(&self.inner.send_hooks).push(hook);
        Ok(())
    }

    pub fn on_update_activity(&self, hook: Arc<dyn UpdateActivityHook>) -> Result<(), TurnError> {
        self.ensure_active()?;
        lock(&self.inner.update_hooks).push(hook);
        Ok(())
    }

    pub fn on_delete_activity(&self, hook: Arc<dyn DeleteActivityHook>) -> Result<(), TurnError> {
        self.ensure_active()?;
        lock(&self.inner.delete_hooks).push(hook);
        Ok(())
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<ResourceResponse, TurnError> {
        self.send_activity(Activity::message(text)).await
    }

    pub async fn send_activity(&self, activity: Activity) -> Result<ResourceResponse, TurnError> {
        let mut responses = self.send_activities(vec![activity]).await?;
        Ok(responses.pop().unwrap_or_default())
    }

    /// Addresses each activity to this conversation and runs the send hooks.
    pub async fn send_activities(
        &self,
        activities: Vec<Activity>,
    ) -> Result<Vec<ResourceResponse>, TurnError> {
        self.ensure_active()?;
        let reference = self.inner.activity.conversation_reference();
        let prepared = activities
            .into_iter()
            .map(|mut activity| {
                activity.apply_conversation_reference(&reference, false);
                if activity.r#type.is_empty() {
                    activity.r#type = activity_types::MESSAGE.to_string();
                }
                activity
            })
            .collect();
        let hooks = lock(&self.inner.send_hooks).clone();
        SendNext::new(self, &hooks).run(prepared).await
    }

    pub async fn send_trace_activity(
        &self,
        name: impl Into<String>,
        value: Option<Value>,
        value_type: Option<String>,
        label: Option<String>,
    ) -> Result<ResourceResponse, TurnError> {
        self.send_activity(Activity::trace(name, value, value_type, label))
            .await
    }

    pub async fn update_activity(&self, mut activity: Activity) -> Result<ResourceResponse, TurnError> {
        self.ensure_active()?;
        let reference = self.inner.activity.conversation_reference();
        activity.apply_conversation_reference(&reference, false);
        let hooks = lock(&self.inner.update_hooks).clone();
        UpdateNext::new(self, &hooks).run(activity).await
    }

    pub async fn delete_activity(&self, activity_id: &str) -> Result<(), TurnError> {
        self.ensure_active()?;
        let mut reference = self.inner.activity.conversation_reference();
        reference.activity_id = Some(activity_id.to_string());
        let hooks = lock(&self.inner.delete_hooks).clone();
        DeleteNext::new(self, &hooks).run(reference).await
    }

    /// Replies captured so far in `expectReplies` mode.
    pub fn buffered_replies(&self) -> Result<Vec<Activity>, TurnError> {
        self.ensure_active()?;
        Ok(lock(&self.inner.buffered).clone())
    }

    pub(crate) async fn dispatch_send(
        &self,
        activities: Vec<Activity>,
    ) -> Result<Vec<ResourceResponse>, TurnError> {
        self.ensure_active()?;
        let sent_non_trace = activities
            .iter()
            .any(|activity| !activity.is_type(activity_types::TRACE));

        let responses = if self.inner.activity.is_expect_replies() {
            let mut responses = Vec::with_capacity(activities.len());
            for activity in activities {
                if activity.is_type(activity_types::INVOKE_RESPONSE) {
                    self.set_turn_state(TurnStateValue::InvokeResponse(activity))?;
                } else {
                    lock(&self.inner.buffered).push(activity);
                }
                responses.push(ResourceResponse::default());
            }
            debug!(count = responses.len(), "buffered replies");
            responses
        } else {
            self.inner
                .adapter
                .send_activities(self, activities)
                .await?
        };

        if sent_non_trace {
            self.inner.responded.store(true, Ordering::Release);
        }
        Ok(responses)
    }

    pub(crate) async fn dispatch_update(
        &self,
        activity: Activity,
    ) -> Result<ResourceResponse, TurnError> {
        self.ensure_active()?;
        self.inner.adapter.update_activity(self, activity).await
    }

    pub(crate) async fn dispatch_delete(
        &self,
        reference: ConversationReference,
    ) -> Result<(), TurnError> {
        self.ensure_active()?;
        self.inner.adapter.delete_activity(self, reference).await
    }

    /// Releases the turn. Only the first call yields the outcome.
    pub fn revoke(&self) -> Option<TurnOutcome> {
        if self.inner.revoked.swap(true, Ordering::AcqRel) {
            return None;
        }
        let buffered = std::mem::take(&mut *lock(&self.inner.buffered));
        let invoke_response = {
            let mut state = lock(&self.inner.state);
            let response = state.invoke_response().map(InvokeResponse::from_activity);
            state.clear();
            response
        };
        lock(&self.inner.send_hooks).clear();
        lock(&self.inner.update_hooks).clear();
        lock(&self.inner.delete_hooks).clear();
        Some(TurnOutcome {
            buffered,
            invoke_response,
            responded: self.inner.responded.load(Ordering::Acquire),
        })
    }
}

impl fmt::Debug for TurnContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TurnContext")
            .field("activity_type", &self.inner.activity.r#type)
            .field("conversation_id", &self.inner.activity.conversation_id())
            .field("revoked", &self.is_revoked())
            .finish()
    }
}

/// Revokes its context when dropped, so a turn is released on every exit path.
pub struct RevocationGuard {
    context: TurnContext,
}

impl RevocationGuard {
    pub fn new(context: TurnContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &TurnContext {
        &self.context
    }

    pub fn finish(self) -> Option<TurnOutcome> {
        self.context.revoke()
    }
}

impl Drop for RevocationGuard {
    fn drop(&mut self) {
        self.context.revoke();
    }
}
