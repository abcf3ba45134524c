//! A multiplexed outbound connection to one peer.

use crate::config::ConnectionConfig;
use crate::error::{Error, NetworkError, Result};
use crate::network::rpc::{frame_bounded, read_frame, write_framed, Message};
use crate::types::{Call, PeerId, Reply};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// What the caller is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// The handler's reply.
    Request,
    /// Delivery acknowledgement only.
    Fire,
}

/// Outcome delivered to the waiting caller. `None` is an acknowledgement.
type Outcome = Result<Option<Reply>>;

/// A call submitted on a connection and not yet answered.
pub struct PendingCall {
    kind: CallKind,
    call: Call,
    tx: oneshot::Sender<Outcome>,
}

impl PendingCall {
    pub fn kind(&self) -> CallKind {
        self.kind
    }

    pub fn call(&self) -> &Call {
        &self.call
    }

    /// Complete the call with an error.
    pub fn fail(self, err: Error) {
        let _ = self.tx.send(Err(err));
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("kind", &self.kind)
            .field("call", &self.call)
            .finish()
    }
}

/// Connection to a peer. Many calls share it, correlated by sequence number.
///
/// When the stream drops, the connection is reported once on the disconnect
/// channel; the receiver decides whether to replay or fail what is pending.
pub struct PeerConnection {
    /// Unique id within the owning manager.
    id: u64,

    /// Peer this connection reaches.
    peer: PeerId,

    /// Remote address.
    addr: SocketAddr,

    /// Whether a drop may be healed by reconnecting in place.
    reconnectable: bool,

    /// When the stream was established.
    established: Instant,

    /// Encoded frames queued for the writer task.
    outbound: mpsc::UnboundedSender<Vec<u8>>,

    /// Largest frame body this connection will send.
    max_message_size: usize,

    /// Calls awaiting an answer, in submission order.
    pending: Mutex<BTreeMap<u64, PendingCall>>,

    /// Sequence number for the next call.
    next_seq: AtomicU64,

    closed: AtomicBool,

    /// Where to report a dropped stream.
    disconnects: mpsc::UnboundedSender<Arc<PeerConnection>>,

    request_timeout: Option<Duration>,

    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerConnection {
    /// Open a connection to `addr`.
    pub async fn connect(
        id: u64,
        peer: PeerId,
        addr: SocketAddr,
        config: &ConnectionConfig,
        max_message_size: usize,
        reconnectable: bool,
        disconnects: mpsc::UnboundedSender<Arc<PeerConnection>>,
    ) -> Result<Arc<Self>> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::ConnectionFailed {
                addr: addr.to_string(),
                reason: "connect timeout".to_string(),
            })?
            .map_err(|e| NetworkError::ConnectionFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true).ok();

        let (mut reader, mut writer) = stream.into_split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let conn = Arc::new_cyclic(|weak: &Weak<PeerConnection>| {
            let read_handle = {
                let weak = weak.clone();
                tokio::spawn(async move {
                    loop {
                        let msg = match read_frame(&mut reader, max_message_size).await {
                            Ok(Some(msg)) => msg,
                            Ok(None) => break,
                            Err(e) => {
                                trace!(error = %e, "Peer connection read failed");
                                break;
                            }
                        };
                        match weak.upgrade() {
                            Some(conn) => conn.on_message(msg),
                            None => return,
                        }
                    }
                    if let Some(conn) = weak.upgrade() {
                        conn.on_closed();
                    }
                })
            };

            let write_handle = {
                let weak = weak.clone();
                tokio::spawn(async move {
                    while let Some(framed) = outbound_rx.recv().await {
                        if let Err(e) = write_framed(&mut writer, &framed).await {
                            trace!(error = %e, "Peer connection write failed");
                            if let Some(conn) = weak.upgrade() {
                                conn.on_closed();
                            }
                            return;
                        }
                    }
                })
            };

            PeerConnection {
                id,
                peer,
                addr,
                reconnectable,
                established: Instant::now(),
                outbound,
                max_message_size,
                pending: Mutex::new(BTreeMap::new()),
                next_seq: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                disconnects,
                request_timeout: config.request_timeout,
                tasks: Mutex::new(vec![read_handle, write_handle]),
            }
        });

        debug!(peer = %conn.peer, addr = %addr, conn = id, reconnectable, "Connected to peer");
        Ok(conn)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn reconnectable(&self) -> bool {
        self.reconnectable
    }

    /// Time since the stream was established.
    pub fn age(&self) -> Duration {
        self.established.elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of calls awaiting an answer.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Send a call and wait for the handler's reply.
    pub async fn request(&self, call: Call) -> Result<Reply> {
        match self.submit(CallKind::Request, call).await? {
            Some(reply) => Ok(reply),
            None => Err(NetworkError::UnexpectedMessage("ack".to_string()).into()),
        }
    }

    /// Send a call and wait for its delivery acknowledgement.
    pub async fn fire(&self, call: Call) -> Result<()> {
        self.submit(CallKind::Fire, call).await.map(|_| ())
    }

    async fn submit(&self, kind: CallKind, call: Call) -> Outcome {
        let (tx, rx) = oneshot::channel();
        let seq = self.enqueue(PendingCall { kind, call, tx })?;

        let answer = match self.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(answer) => answer,
                Err(_) => {
                    self.pending.lock().remove(&seq);
                    return Err(NetworkError::Timeout.into());
                }
            },
            None => rx.await,
        };

        // A dropped sender means the call was abandoned with the connection.
        answer.map_err(|_| Error::from(NetworkError::ConnectionClosed))?
    }

    /// Register and transmit a call. Returns its sequence number.
    ///
    /// A call too large to frame is rejected here and never reaches the
    /// writer, so the connection stays usable for everyone else.
    fn enqueue(&self, pending: PendingCall) -> Result<u64> {
        if self.is_closed() {
            return Err(NetworkError::ConnectionClosed.into());
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let msg = match pending.kind {
            CallKind::Request => Message::Request {
                seq,
                call: pending.call.clone(),
            },
            CallKind::Fire => Message::Fire {
                seq,
                call: pending.call.clone(),
            },
        };
        let framed = frame_bounded(&msg, self.max_message_size)?;
        self.pending.lock().insert(seq, pending);

        if self.outbound.send(framed).is_err() || self.is_closed() {
            // Whoever drained the pending set owns the call now.
            if self.pending.lock().remove(&seq).is_some() {
                return Err(NetworkError::ConnectionClosed.into());
            }
        }
        trace!(peer = %self.peer, seq, "Call submitted");
        Ok(seq)
    }

    /// Remove every pending call in submission order.
    pub fn take_pending(&self) -> Vec<PendingCall> {
        std::mem::take(&mut *self.pending.lock()).into_values().collect()
    }

    /// Resubmit calls taken from a dropped connection, preserving order.
    /// Calls that cannot be sent fail with `ConnectionClosed`.
    pub fn replay(&self, calls: Vec<PendingCall>) {
        let count = calls.len();
        let mut calls = calls.into_iter();
        for pending in calls.by_ref() {
            if self.is_closed() {
                pending.fail(NetworkError::ConnectionClosed.into());
                break;
            }
            // enqueue only fails after the call was reclaimed or dropped
            let _ = self.enqueue(pending);
        }
        for pending in calls {
            pending.fail(NetworkError::ConnectionClosed.into());
        }
        debug!(peer = %self.peer, count, "Replayed pending calls");
    }

    /// Fail every pending call with `ConnectionClosed`.
    pub fn fail_pending(&self) {
        for pending in self.take_pending() {
            pending.fail(NetworkError::ConnectionClosed.into());
        }
    }

    /// Tear down the connection without reporting it as dropped.
    pub fn destroy(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        self.fail_pending();
        debug!(peer = %self.peer, conn = self.id, "Connection destroyed");
    }

    fn on_message(&self, msg: Message) {
        let (seq, outcome) = match msg {
            Message::Response { seq, result } => (seq, result.map(Some).map_err(Error::Remote)),
            Message::Ack { seq } => (seq, Ok(None)),
            other => {
                debug!(peer = %self.peer, kind = other.kind(), "Ignoring unexpected message");
                return;
            }
        };

        match self.pending.lock().remove(&seq) {
            Some(pending) => {
                let _ = pending.tx.send(outcome);
            }
            None => trace!(peer = %self.peer, seq, "Answer for unknown call"),
        }
    }

    fn on_closed(self: Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(peer = %self.peer, conn = self.id, pending = self.pending_count(), "Peer connection dropped");

        if let Err(mpsc::error::SendError(conn)) = self.disconnects.send(self.clone()) {
            conn.fail_pending();
        }
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("addr", &self.addr)
            .field("reconnectable", &self.reconnectable)
            .field("closed", &self.is_closed())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}
