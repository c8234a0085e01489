use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::activity::Activity;
use crate::connector::ConnectorClient;
use crate::identity::ClaimsIdentity;
use crate::user_token::UserTokenClient;

/// Slots of the per-turn side table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnStateKey {
    Identity,
    ConnectorClient,
    UserTokenClient,
    OAuthScope,
    InvokeResponse,
}

#[derive(Clone)]
pub enum TurnStateValue {
    Identity(ClaimsIdentity),
    ConnectorClient(Arc<dyn ConnectorClient>),
    UserTokenClient(Arc<dyn UserTokenClient>),
    OAuthScope(String),
    /// The `invokeResponse` activity emitted by the handler.
    InvokeResponse(Activity),
}

impl TurnStateValue {
    pub fn key(&self) -> TurnStateKey {
        match self {
            TurnStateValue::Identity(_) => TurnStateKey::Identity,
            TurnStateValue::ConnectorClient(_) => TurnStateKey::ConnectorClient,
            TurnStateValue::UserTokenClient(_) => TurnStateKey::UserTokenClient,
            TurnStateValue::OAuthScope(_) => TurnStateKey::OAuthScope,
            TurnStateValue::InvokeResponse(_) => TurnStateKey::InvokeResponse,
        }
    }
}

impl fmt::Debug for TurnStateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnStateValue::Identity(identity) => f.debug_tuple("Identity").field(identity).finish(),
            TurnStateValue::ConnectorClient(_) => f.write_str("ConnectorClient(..)"),
            TurnStateValue::UserTokenClient(_) => f.write_str("UserTokenClient(..)"),
            TurnStateValue::OAuthScope(scope) => f.debug_tuple("OAuthScope").field(scope).finish(),
            TurnStateValue::InvokeResponse(activity) => {
                f.debug_tuple("InvokeResponse").field(activity).finish()
            }
        }
    }
}

/// Keyed stacks of ambient services. A nested turn pushes its own value and
/// pops it afterwards, restoring the outer one.
#[derive(Debug, Default)]
pub struct TurnState {
    slots: HashMap<TurnStateKey, Vec<TurnStateValue>>,
}

impl TurnState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: TurnStateValue) {
        self.slots.entry(value.key()).or_default().push(value);
    }

    pub fn pop(&mut self, key: TurnStateKey) -> Option<TurnStateValue> {
        let stack = self.slots.get_mut(&key)?;
        let value = stack.pop();
        if stack.is_empty() {
            self.slots.remove(&key);
        }
        value
    }

    /// Replaces the innermost value for the key, or pushes when the slot is empty.
    pub fn set(&mut self, value: TurnStateValue) {
        let stack = self.slots.entry(value.key()).or_default();
        stack.pop();
        stack.push(value);
    }

    pub fn get(&self, key: TurnStateKey) -> Option<&TurnStateValue> {
        self.slots.get(&key).and_then(|stack| stack.last())
    }

    pub fn remove(&mut self, key: TurnStateKey) {
        self.slots.remove(&key);
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    pub fn identity(&self) -> Option<&ClaimsIdentity> {
        match self.get(TurnStateKey::Identity)? {
            TurnStateValue::Identity(identity) => Some(identity),
            _ => None,
        }
    }

    pub fn connector_client(&self) -> Option<Arc<dyn ConnectorClient>> {
        match self.get(TurnStateKey::ConnectorClient)? {
            TurnStateValue::ConnectorClient(client) => Some(client.clone()),
            _ => None,
        }
    }

    pub fn user_token_client(&self) -> Option<Arc<dyn UserTokenClient>> {
        match self.get(TurnStateKey::UserTokenClient)? {
            TurnStateValue::UserTokenClient(client) => Some(client.clone()),
            _ => None,
        }
    }

    pub fn oauth_scope(&self) -> Option<&str> {
        match self.get(TurnStateKey::OAuthScope)? {
            TurnStateValue::OAuthScope(scope) => Some(scope.as_str()),
            _ => None,
        }
    }

    pub fn invoke_response(&self) -> Option<&Activity> {
        match self.get(TurnStateKey::InvokeResponse)? {
            TurnStateValue::InvokeResponse(activity) => Some(activity),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_shadows_and_pop_restores_outer_value() {
        let mut state = TurnState::new();
        state.push(TurnStateValue::OAuthScope("outer".into()));
        state.push(TurnStateValue::OAuthScope("inner".into()));
        assert_eq!(state.oauth_scope(), Some("inner"));

        let popped = state.pop(TurnStateKey::OAuthScope);
        assert!(matches!(popped, Some(TurnStateValue::OAuthScope(ref s)) if s == "inner"));
        assert_eq!(state.oauth_scope(), Some("outer"));

        state.pop(TurnStateKey::OAuthScope);
        assert_eq!(state.oauth_scope(), None);
        assert!(state.pop(TurnStateKey::OAuthScope).is_none());
    }

    #[test]
    fn set_replaces_only_the_innermost_value() {
        let mut state = TurnState::new();
        state.set(TurnStateValue::OAuthScope("first".into()));
        state.push(TurnStateValue::OAuthScope("nested".into()));
        state.set(TurnStateValue::OAuthScope("replaced".into()));
        assert_eq!(state.oauth_scope(), Some("replaced"));
        state.pop(TurnStateKey::OAuthScope);
        assert_eq!(state.oauth_scope(), Some("first"));
    }

    #[test]
    fn keys_do_not_collide() {
        let mut state = TurnState::new();
        state.push(TurnStateValue::Identity(ClaimsIdentity::for_agent("app")));
        state.push(TurnStateValue::InvokeResponse(Activity::new("invokeResponse")));
        assert_eq!(state.identity().and_then(|id| id.audience()), Some("app"));
        assert!(state.invoke_response().is_some());
        assert!(state.connector_client().is_none());
        state.remove(TurnStateKey::InvokeResponse);
        assert!(state.invoke_response().is_none());
        assert!(state.identity().is_some());
    }
}
