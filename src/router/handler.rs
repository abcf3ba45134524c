//! Handlers invoked for calls owned by the local node.

use crate::error::Result;
use crate::types::Call;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;

/// Processes a call and produces the reply body.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, call: Call) -> Result<Bytes>;
}

/// Resolves the handler for a call.
pub trait HandlerRegistry: Send + Sync + 'static {
    /// The handler for `call`, or `None` if nothing matches.
    fn lookup(&self, call: &Call) -> Option<Arc<dyn Handler>>;
}

/// Registry keyed by the exact command name of a call.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: DashMap<String, Arc<dyn Handler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `cmd`, replacing any previous one.
    pub fn register<H: Handler>(&self, cmd: impl Into<String>, handler: H) -> &Self {
        self.handlers.insert(cmd.into(), Arc::new(handler));
        self
    }

    /// Register an async closure for `cmd`.
    pub fn register_fn<F, Fut>(&self, cmd: impl Into<String>, f: F) -> &Self
    where
        F: Fn(Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        self.register(cmd, handler_fn(f))
    }

    /// Remove the handler for `cmd`.
    pub fn unregister(&self, cmd: &str) -> bool {
        self.handlers.remove(cmd).is_some()
    }

    pub fn contains(&self, cmd: &str) -> bool {
        self.handlers.contains_key(cmd)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl HandlerRegistry for CommandRegistry {
    fn lookup(&self, call: &Call) -> Option<Arc<dyn Handler>> {
        self.handlers.get(&call.cmd).map(|h| h.value().clone())
    }
}

/// Handler backed by an async closure.
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Call) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Call) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes>> + Send + 'static,
{
    async fn handle(&self, call: Call) -> Result<Bytes> {
        (self.f)(call).await
    }
}
