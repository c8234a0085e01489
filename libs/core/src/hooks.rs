//! Interception chains for outbound send, update and delete operations.
//!
//! Hooks run in registration order. A hook short-circuits the chain by
//! returning without calling `next.run(..)`; an error returned by a hook
//! fails the outer operation.

use std::sync::Arc;

use async_trait::async_trait;

use crate::activity::{Activity, ResourceResponse};
use crate::context::TurnContext;
use crate::error::TurnError;
use crate::reference::ConversationReference;

#[async_trait]
pub trait SendActivitiesHook: Send + Sync {
    async fn on_send(
        &self,
        context: &TurnContext,
        activities: Vec<Activity>,
        next: SendNext<'_>,
    ) -> Result<Vec<ResourceResponse>, TurnError>;
}

#[async_trait]
pub trait UpdateActivityHook: Send + Sync {
    async fn on_update(
        &self,
        context: &TurnContext,
        activity: Activity,
        next: UpdateNext<'_>,
    ) -> Result<ResourceResponse, TurnError>;
}

#[async_trait]
pub trait DeleteActivityHook: Send + Sync {
    async fn on_delete(
        &self,
        context: &TurnContext,
        reference: ConversationReference,
        next: DeleteNext<'_>,
    ) -> Result<(), TurnError>;
}

pub struct SendNext<'a> {
    context: &'a TurnContext,
    remaining: &'a [Arc<dyn SendActivitiesHook>],
}

impl<'a> SendNext<'a> {
    pub(crate) fn new(context: &'a TurnContext, remaining: &'a [Arc<dyn SendActivitiesHook>]) -> Self {
        Self { context, remaining }
    }

    pub async fn run(self, activities: Vec<Activity>) -> Result<Vec<ResourceResponse>, TurnError> {
        match self.remaining.split_first() {
            Some((hook, rest)) => {
                hook.on_send(self.context, activities, SendNext::new(self.context, rest))
                    .await
            }
            None => self.context.dispatch_send(activities).await,
        }
    }
}

pub struct UpdateNext<'a> {
    context: &'a TurnContext,
    remaining: &'a [Arc<dyn UpdateActivityHook>],
}

impl<'a> UpdateNext<'a> {
    pub(crate) fn new(context: &'a TurnContext, remaining: &'a [Arc<dyn UpdateActivityHook>]) -> Self {
        Self { context, remaining }
    }

    pub async fn run(self, activity: Activity) -> Result<ResourceResponse, TurnError> {
        match self.remaining.split_first() {
            Some((hook, rest)) => {
                hook.on_update(self.context, activity, UpdateNext::new(self.context, rest))
                    .await
            }
            None => self.context.dispatch_update(activity).await,
        }
    }
}

pub struct DeleteNext<'a> {
    context: &'a TurnContext,
    remaining: &'a [Arc<dyn DeleteActivityHook>],
}

impl<'a> DeleteNext<'a> {
    pub(crate) fn new(context: &'a TurnContext, remaining: &'a [Arc<dyn DeleteActivityHook>]) -> Self {
        Self { context, remaining }
    }

    pub async fn run(self, reference: ConversationReference) -> Result<(), TurnError> {
        match self.remaining.split_first() {
            Some((hook, rest)) => {
                hook.on_delete(self.context, reference, DeleteNext::new(self.context, rest))
                    .await
            }
            None => self.context.dispatch_delete(reference).await,
        }
    }
}
