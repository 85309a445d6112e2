//! Ordered middleware chain in front of the model call.
//!
//! Stages implement [`ChatMiddleware`]. Each one receives the request context and a [`Next`]
//! continuation and may reject the request without calling `next`, call `next` and post-process
//! the response, or simply pass through.
//!
//! [`ChatPipelineBuilder::build`] sorts the stages ascending by [`ChatMiddleware::order`] (lower runs
//! first, ties keep registration order) and folds them right-to-left around the terminal
//! [`ChatHandler`]. The chain is fixed once built; handling a request walks it without any further
//! sorting or allocation of links.

use std::sync::Arc;

use tracing::debug;

use crate::chat::context::{ChatContext, ChatResponse};
use crate::errors::Result;

/// Anything that can turn a request into a response: the model call, or a composed chain.
#[async_trait::async_trait]
pub trait ChatHandler: Send + Sync {
    async fn handle(&self, ctx: ChatContext) -> Result<ChatResponse>;
}

#[async_trait::async_trait]
pub trait ChatMiddleware: Send + Sync {
    /// Position in the chain. Lower runs earlier.
    fn order(&self) -> i32;

    /// Name used in logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    async fn invoke(&self, ctx: ChatContext, next: Next<'_>) -> Result<ChatResponse>;
}

/// The rest of the chain after the current stage.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    inner: &'a dyn ChatHandler,
}

impl<'a> Next<'a> {
    pub async fn run(self, ctx: ChatContext) -> Result<ChatResponse> {
        self.inner.handle(ctx).await
    }
}

// One stage bound to everything after it
struct Link {
    stage: Arc<dyn ChatMiddleware>,
    next: Arc<dyn ChatHandler>,
}

#[async_trait::async_trait]
impl ChatHandler for Link {
    async fn handle(&self, ctx: ChatContext) -> Result<ChatResponse> {
        self.stage.invoke(ctx, Next { inner: self.next.as_ref() }).await
    }
}

#[derive(Default)]
pub struct ChatPipelineBuilder {
    stages: Vec<Arc<dyn ChatMiddleware>>,
}

impl ChatPipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, stage: impl ChatMiddleware + 'static) -> Self {
        self.with_shared(Arc::new(stage))
    }

    pub fn with_shared(mut self, stage: Arc<dyn ChatMiddleware>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn build(mut self, terminal: impl ChatHandler + 'static) -> ChatPipeline {
        // sort_by_key is stable, so equal orders keep registration order
        self.stages.sort_by_key(|stage| stage.order());

        let stage_names: Vec<&'static str> = self.stages.iter().map(|stage| stage.name()).collect();
        debug!(stages = ?stage_names, "Building chat pipeline");

        let terminal: Arc<dyn ChatHandler> = Arc::new(terminal);
        let entry = self
            .stages
            .into_iter()
            .rev()
            .fold(terminal, |next, stage| Arc::new(Link { stage, next }) as Arc<dyn ChatHandler>);

        ChatPipeline { entry, stage_names }
    }
}

/// A composed chain, ready to handle requests.
#[derive(Clone)]
pub struct ChatPipeline {
    entry: Arc<dyn ChatHandler>,
    stage_names: Vec<&'static str>,
}

impl ChatPipeline {
    pub fn builder() -> ChatPipelineBuilder {
        ChatPipelineBuilder::new()
    }

    /// Stage names in execution order.
    pub fn stage_names(&self) -> &[&'static str] {
        &self.stage_names
    }

    pub async fn handle(&self, ctx: ChatContext) -> Result<ChatResponse> {
        self.entry.handle(ctx).await
    }
}

#[async_trait::async_trait]
impl ChatHandler for ChatPipeline {
    async fn handle(&self, ctx: ChatContext) -> Result<ChatResponse> {
        self.entry.handle(ctx).await
    }
}
