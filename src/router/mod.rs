//! Key-addressed call routing.
//!
//! A call is handled locally when the local node owns its key and forwarded
//! to the owner otherwise. Remote attempts that fail because the connection
//! dropped or because ownership moved mid-flight are retried after a fixed
//! backoff, re-resolving the owner against the current ring each time.

pub mod handler;
pub mod retry;

pub use handler::{handler_fn, CommandRegistry, FnHandler, Handler, HandlerRegistry};
pub use retry::RetryState;

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::network::{ConnectionManager, PeerConnection};
use crate::partitioning::Ring;
use crate::types::{Call, Peer, Point, Reply, RequestId};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Largest correlation id before wrapping.
const MAX_REQUEST_ID: u64 = 0x7fff_ffff;

/// Caller-supplied source of correlation ids, consulted for calls that
/// arrive without one.
#[derive(Clone)]
pub struct RequestIdGenerator(Arc<dyn Fn(&Call) -> RequestId + Send + Sync>);

impl RequestIdGenerator {
    pub fn new<F>(generate: F) -> Self
    where
        F: Fn(&Call) -> RequestId + Send + Sync + 'static,
    {
        Self(Arc::new(generate))
    }

    pub fn generate(&self, call: &Call) -> RequestId {
        (self.0)(call)
    }
}

impl fmt::Debug for RequestIdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestIdGenerator").finish_non_exhaustive()
    }
}

/// Node-local correlation id generator.
#[derive(Debug, Default)]
pub struct RequestIds {
    last: AtomicU64,
    generator: Option<RequestIdGenerator>,
}

impl RequestIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `generator` instead of the built-in sequence.
    pub fn with_generator(generator: RequestIdGenerator) -> Self {
        Self {
            last: AtomicU64::new(0),
            generator: Some(generator),
        }
    }

    /// Next id in sequence.
    pub fn next(&self) -> RequestId {
        let prev = self
            .last
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |prev| {
                Some((prev + 1) & MAX_REQUEST_ID)
            })
            .unwrap_or_default();
        (prev + 1) & MAX_REQUEST_ID
    }

    /// Give `call` an id unless the caller already chose one.
    pub fn assign(&self, call: &mut Call) -> RequestId {
        if let Some(id) = call.id {
            return id;
        }
        let id = match &self.generator {
            Some(generator) => generator.generate(call),
            None => self.next(),
        };
        call.id = Some(id);
        id
    }
}

/// Dispatches calls to the owner of their key.
pub struct RequestRouter {
    ring: Arc<dyn Ring>,
    connections: Arc<ConnectionManager>,
    registry: Arc<dyn HandlerRegistry>,
    retry: RetryConfig,
    ids: RequestIds,
    ready: watch::Receiver<bool>,
    closed: AtomicBool,
}

impl RequestRouter {
    pub fn new(
        ring: Arc<dyn Ring>,
        connections: Arc<ConnectionManager>,
        registry: Arc<dyn HandlerRegistry>,
        retry: RetryConfig,
        ready: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ring,
            connections,
            registry,
            retry,
            ids: RequestIds::new(),
            ready,
            closed: AtomicBool::new(false),
        }
    }

    /// Replace the correlation id source.
    pub fn with_request_ids(mut self, ids: RequestIds) -> Self {
        self.ids = ids;
        self
    }

    /// Route a call and wait for the handler's reply.
    pub async fn request(&self, mut call: Call) -> Result<Reply> {
        let id = self.ids.assign(&mut call);
        self.wait_ready().await?;

        let point = self.ring.hash(&call.key);
        let mut retry = RetryState::new(&self.retry);

        loop {
            self.ensure_open()?;

            if self.ring.allocated_to_me(point) {
                trace!(request_id = id, key = %call.key, "Dispatching locally");
                return self.dispatch_local(call).await;
            }

            let (peer, conn) = match self.resolve(point).await? {
                Some(target) => target,
                None => {
                    retry.backoff().await?;
                    continue;
                }
            };

            trace!(request_id = id, key = %call.key, peer = %peer.id, attempt = retry.attempt(), "Forwarding request");
            match conn.request(call.clone()).await {
                Ok(reply) => return Ok(reply),
                Err(e) if self.should_retry(point, &peer, &conn, &e) => {
                    debug!(request_id = id, peer = %peer.id, error = %e, attempt = retry.attempt(), "Request failed, retrying");
                    retry.backoff().await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Route a call and wait only until it is delivered. A local handler
    /// runs in the background after this returns.
    pub async fn fire(&self, mut call: Call) -> Result<()> {
        let id = self.ids.assign(&mut call);
        self.wait_ready().await?;

        let point = self.ring.hash(&call.key);
        let mut retry = RetryState::new(&self.retry);

        loop {
            self.ensure_open()?;

            if self.ring.allocated_to_me(point) {
                trace!(request_id = id, key = %call.key, "Firing locally");
                return self.fire_local(call);
            }

            let (peer, conn) = match self.resolve(point).await? {
                Some(target) => target,
                None => {
                    retry.backoff().await?;
                    continue;
                }
            };

            trace!(request_id = id, key = %call.key, peer = %peer.id, attempt = retry.attempt(), "Firing remotely");
            match conn.fire(call.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if self.should_retry(point, &peer, &conn, &e) => {
                    debug!(request_id = id, peer = %peer.id, error = %e, attempt = retry.attempt(), "Fire failed, retrying");
                    retry.backoff().await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fire without waiting. Failures are logged.
    pub fn fire_and_forget(self: &Arc<Self>, call: Call) {
        let router = self.clone();
        tokio::spawn(async move {
            let key = call.key.clone();
            if let Err(e) = router.fire(call).await {
                debug!(key = %key, error = %e, "Fire-and-forget call failed");
            }
        });
    }

    /// Handle a call that a peer forwarded to this node.
    pub async fn serve(&self, mut call: Call) -> Result<Reply> {
        self.ids.assign(&mut call);
        self.wait_ready().await?;
        self.dispatch_local(call).await
    }

    /// Start a forwarded fire on this node without waiting for the handler.
    pub async fn serve_fire(&self, mut call: Call) -> Result<()> {
        self.ids.assign(&mut call);
        self.wait_ready().await?;
        self.fire_local(call)
    }

    /// Reject every later call with `Error::Closed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn request_ids(&self) -> &RequestIds {
        &self.ids
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    async fn wait_ready(&self) -> Result<()> {
        self.ensure_open()?;
        let mut ready = self.ready.clone();
        ready.wait_for(|up| *up).await.map_err(|_| Error::Closed)?;
        Ok(())
    }

    /// Resolve the owner of `point` and a connection to it. `None` means the
    /// transport failed and the attempt should be retried.
    async fn resolve(&self, point: Point) -> Result<Option<(Peer, Arc<PeerConnection>)>> {
        let peer = self.ring.lookup(point);
        if peer.transport_addr().is_none() {
            return Err(Error::InvalidPeerMetadata { peer: peer.id });
        }

        match self.connections.connection_for(&peer).await {
            Ok(conn) => Ok(Some((peer, conn))),
            Err(e) if e.is_transport_failure() => {
                debug!(peer = %peer.id, error = %e, "Could not reach owner");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// A failure is transient if the connection is gone or the key now
    /// belongs to someone else.
    fn should_retry(&self, point: Point, peer: &Peer, conn: &PeerConnection, err: &Error) -> bool {
        err.is_transport_failure() || conn.is_closed() || self.ring.lookup(point).id != peer.id
    }

    async fn dispatch_local(&self, call: Call) -> Result<Reply> {
        let handler = self.registry.lookup(&call).ok_or(Error::NoHandler)?;
        let id = call.id;

        // Runs on its own task so the caller's stack is never re-entered.
        let payload = tokio::spawn(async move { handler.handle(call).await })
            .await
            .map_err(|e| Error::Internal(format!("handler task failed: {}", e)))??;

        Ok(Reply { id, payload })
    }

    fn fire_local(&self, call: Call) -> Result<()> {
        let handler = self.registry.lookup(&call).ok_or(Error::NoHandler)?;
        tokio::spawn(async move {
            let id = call.id;
            if let Err(e) = handler.handle(call).await {
                debug!(request_id = ?id, error = %e, "Fired handler failed");
            }
        });
        Ok(())
    }
}
