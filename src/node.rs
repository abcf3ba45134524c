//! A ring member: listener, ring view, trackers, connections and router.

use crate::cluster::events::RingEvent;
use crate::cluster::join::join_seed;
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::network::{ConnectionManager, Message, MessageHandler, NetworkServer};
use crate::partitioning::{ClusterRing, KeyTracker, Ring, TrackOptions, Tracker};
use crate::router::{HandlerRegistry, RequestIds, RequestRouter};
use crate::types::{Call, Peer, PeerId, Reply};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A running member of the ring.
pub struct RingNode {
    config: NodeConfig,

    /// Address the listener is bound to.
    local_addr: SocketAddr,

    ring: Arc<ClusterRing>,
    keys: Arc<KeyTracker>,
    connections: Arc<ConnectionManager>,
    router: Arc<RequestRouter>,

    /// Flipped once the ring is up.
    ready_tx: watch::Sender<bool>,

    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    server_task: Mutex<Option<JoinHandle<Result<()>>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,

    closed: AtomicBool,
}

impl RingNode {
    /// Bind the listener, join the ring as its only member and start
    /// serving. Seeds in the config are joined before this returns.
    pub async fn start(config: NodeConfig, registry: Arc<dyn HandlerRegistry>) -> Result<Arc<Self>> {
        config.validate().map_err(Error::Config)?;

        let (server, shutdown_tx) =
            NetworkServer::bind(config.bind_addr, config.max_message_size).await?;
        let local_addr = server.local_addr();
        let advertise = config.advertise_addr.unwrap_or(local_addr);

        let me = Peer::listening_on(advertise, config.points_per_peer);
        let ring = Arc::new(ClusterRing::new(me));
        let keys = Arc::new(KeyTracker::new(ring.clone()));
        let connections = ConnectionManager::new(config.connection.clone(), config.max_message_size);

        let (ready_tx, ready_rx) = watch::channel(false);
        let mut router = RequestRouter::new(
            ring.clone(),
            connections.clone(),
            registry,
            config.retry.clone(),
            ready_rx,
        );
        if let Some(generator) = config.request_id_generator.clone() {
            router = router.with_request_ids(RequestIds::with_generator(generator));
        }
        let router = Arc::new(router);

        // Subscribe before the ring can emit anything.
        let events = ring.subscribe();
        let event_task = tokio::spawn(run_event_loop(events, keys.clone(), connections.clone()));

        let handler = Arc::new(NodeHandler {
            router: router.clone(),
            ring: ring.clone(),
        });
        let server_task = tokio::spawn(server.run(handler));

        ring.mark_up();
        ready_tx.send_replace(true);
        info!(id = %ring.whoami(), addr = %local_addr, "Ring node up");

        let node = Arc::new(Self {
            config,
            local_addr,
            ring,
            keys,
            connections,
            router,
            ready_tx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            server_task: Mutex::new(Some(server_task)),
            event_task: Mutex::new(Some(event_task)),
            closed: AtomicBool::new(false),
        });

        if !node.config.seed_peers.is_empty() {
            let seeds = node.config.seed_peers.clone();
            node.join(&seeds).await?;
        }

        Ok(node)
    }

    /// Id of this node, its advertised `address:port`.
    pub fn whoami(&self) -> PeerId {
        self.ring.whoami()
    }

    /// Snapshot of this node as other members see it.
    pub fn mymeta(&self) -> Peer {
        self.ring.mymeta()
    }

    /// Known members other than this node.
    pub fn peers(&self) -> Vec<Peer> {
        self.ring.peers()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_tx.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether this node currently owns `key`.
    pub fn allocated_to_me(&self, key: &str) -> bool {
        self.ring.allocated_to_me(self.ring.hash(key))
    }

    /// Watch a key this node owns.
    pub fn track(&self, key: &str, options: TrackOptions) -> Result<Arc<Tracker>> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.keys.track(key, options)
    }

    /// Watch a key another member owns until this node takes it over.
    pub fn watch_replica(&self, key: &str) -> Result<Arc<Tracker>> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.keys.watch_replica(key)
    }

    /// Stop watching a key.
    pub fn end(&self, tracker: &Tracker) {
        self.keys.end(tracker);
    }

    /// Route a call to the owner of its key and wait for the reply.
    pub async fn request(&self, call: Call) -> Result<Reply> {
        self.router.request(call).await
    }

    /// Route a call and wait only for delivery.
    pub async fn fire(&self, call: Call) -> Result<()> {
        self.router.fire(call).await
    }

    /// Route a call without waiting at all.
    pub fn fire_and_forget(&self, call: Call) {
        self.router.fire_and_forget(call);
    }

    /// Receive ring events from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RingEvent> {
        self.ring.subscribe()
    }

    /// Join through the given seeds, then introduce this node to every
    /// member they report. Succeeds if at least one seed answered.
    pub async fn join(&self, seeds: &[SocketAddr]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let me = self.ring.mymeta();
        let mut queue: Vec<SocketAddr> = seeds.to_vec();
        let mut contacted: HashSet<SocketAddr> = HashSet::new();
        let mut joined_any = false;
        let mut last_error = None;

        while let Some(addr) = queue.pop() {
            if Some(addr) == me.transport_addr() || !contacted.insert(addr) {
                continue;
            }

            let members = match join_seed(
                addr,
                &me,
                self.config.connection.connect_timeout,
                self.config.max_message_size,
            )
            .await
            {
                Ok(members) => members,
                Err(e) => {
                    warn!(seed = %addr, error = %e, "Join attempt failed");
                    last_error = Some(e);
                    continue;
                }
            };
            joined_any = true;

            for member in members {
                if member.id == me.id {
                    continue;
                }
                if let Some(member_addr) = member.transport_addr() {
                    queue.push(member_addr);
                }
                self.ring.peer_up(member);
            }
        }

        match (joined_any, last_error) {
            (false, Some(e)) => Err(e),
            _ => {
                debug!(members = self.ring.members().len(), "Join complete");
                Ok(())
            }
        }
    }

    /// Report that a member failed or left.
    pub fn peer_down(&self, id: &PeerId) -> Option<Peer> {
        self.ring.peer_down(id)
    }

    pub fn ring(&self) -> &Arc<ClusterRing> {
        &self.ring
    }

    pub fn keys(&self) -> &Arc<KeyTracker> {
        &self.keys
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn router(&self) -> &Arc<RequestRouter> {
        &self.router
    }

    /// Shut down: notify every pending tracker with no destination, destroy
    /// peer connections and stop the listener.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.router.close();
        let notified = self.keys.clear();
        self.connections.close();

        let shutdown_tx = self.shutdown_tx.lock().take();
        if let Some(tx) = shutdown_tx {
            let _ = tx.send(()).await;
        }
        let server_task = self.server_task.lock().take();
        if let Some(task) = server_task {
            match task.await {
                Ok(Err(e)) => warn!(error = %e, "Listener stopped with error"),
                Err(e) if !e.is_cancelled() => warn!(error = %e, "Listener task failed"),
                _ => {}
            }
        }
        if let Some(task) = self.event_task.lock().take() {
            task.abort();
        }

        info!(id = %self.whoami(), trackers = notified, "Ring node closed");
        Ok(())
    }
}

impl Drop for RingNode {
    fn drop(&mut self) {
        if let Some(task) = self.server_task.get_mut().take() {
            task.abort();
        }
        if let Some(task) = self.event_task.get_mut().take() {
            task.abort();
        }
    }
}

/// Applies ring events in order: ownership then replicas, with connection
/// eviction on peer-down, followed by the deferred replica pass.
async fn run_event_loop(
    mut events: mpsc::UnboundedReceiver<RingEvent>,
    keys: Arc<KeyTracker>,
    connections: Arc<ConnectionManager>,
) {
    while let Some(event) = events.recv().await {
        event.log();
        if let RingEvent::PeerDown(peer) = &event {
            connections.on_peer_down(&peer.id);
        }
        keys.handle_event(&event);

        tokio::task::yield_now().await;
        keys.run_deferred();
    }
    debug!("Ring event loop stopped");
}

/// Serves inbound peer traffic for a node.
struct NodeHandler {
    router: Arc<RequestRouter>,
    ring: Arc<ClusterRing>,
}

#[async_trait]
impl MessageHandler for NodeHandler {
    async fn handle(&self, msg: Message) -> Option<Message> {
        match msg {
            Message::Request { seq, call } => {
                let result = self.router.serve(call).await.map_err(|e| e.to_string());
                Some(Message::Response { seq, result })
            }
            Message::Fire { seq, call } => {
                if let Err(e) = self.router.serve_fire(call).await {
                    debug!(seq, error = %e, "Inbound fire not dispatched");
                }
                Some(Message::Ack { seq })
            }
            Message::Join(peer) => {
                debug!(peer = %peer.id, "Join request");
                self.ring.peer_up(peer);
                Some(Message::Welcome(self.ring.members()))
            }
            other => {
                debug!(kind = other.kind(), "Ignoring inbound message");
                None
            }
        }
    }
}
