use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::TurnContext;

/// Application logic run once per turn, after all middleware.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn on_turn(&self, context: &TurnContext) -> anyhow::Result<()>;
}

#[async_trait]
pub trait Middleware: Send + Sync {
    /// Call `next.run(context)` to continue the pipeline; returning without
    /// calling it ends the turn early.
    async fn on_turn(&self, context: &TurnContext, next: Next<'_>) -> anyhow::Result<()>;
}

pub struct Next<'a> {
    remaining: &'a [Arc<dyn Middleware>],
    handler: Option<&'a dyn ActivityHandler>,
}

impl<'a> Next<'a> {
    pub async fn run(self, context: &TurnContext) -> anyhow::Result<()> {
        match self.remaining.split_first() {
            Some((middleware, rest)) => {
                let next = Next {
                    remaining: rest,
                    handler: self.handler,
                };
                middleware.on_turn(context, next).await
            }
            None => match self.handler {
                Some(handler) => handler.on_turn(context).await,
                None => Ok(()),
            },
        }
    }
}

/// Ordered middleware pipeline; each entry awaits the previous one.
#[derive(Clone, Default)]
pub struct MiddlewareSet {
    middleware: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.middleware.push(middleware);
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    pub async fn run(
        &self,
        context: &TurnContext,
        handler: Option<&dyn ActivityHandler>,
    ) -> anyhow::Result<()> {
        Next {
            remaining: &self.middleware,
            handler,
        }
        .run(context)
        .await
    }
}

pub struct FnHandler<F> {
    f: F,
}

/// Adapts an async closure into an [`ActivityHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(TurnContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> ActivityHandler for FnHandler<F>
where
    F: Fn(TurnContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn on_turn(&self, context: &TurnContext) -> anyhow::Result<()> {
        (self.f)(context.clone()).await
    }
}
