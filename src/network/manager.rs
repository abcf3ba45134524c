//! One logical connection per peer, healed or evicted on failure.

use crate::config::ConnectionConfig;
use crate::error::{Error, NetworkError, Result};
use crate::network::connection::{PeerConnection, PendingCall};
use crate::types::{Peer, PeerId};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Caches connections by peer id.
///
/// A connection that drops shortly after it was established is reconnected
/// once and its pending calls are replayed in order. If that reconnect
/// fails, the closed connection stays cached until the peer is reported
/// down. Older connections are evicted so the next caller routes against
/// the current ring. A peer-down event evicts at any time and abandons an
/// in-progress reconnect.
pub struct ConnectionManager {
    connections: DashMap<PeerId, Arc<PeerConnection>>,

    /// Reconnect attempts in flight, by peer.
    reconnecting: DashMap<PeerId, JoinHandle<()>>,

    config: ConnectionConfig,

    max_message_size: usize,

    next_id: AtomicU64,

    /// Handed to every connection to report drops.
    disconnects: mpsc::UnboundedSender<Arc<PeerConnection>>,

    closed: AtomicBool,

    /// Back-reference for spawned reconnect tasks.
    this: Weak<ConnectionManager>,
}

impl ConnectionManager {
    /// Create a manager and spawn its disconnect handler.
    pub fn new(config: ConnectionConfig, max_message_size: usize) -> Arc<Self> {
        let (disconnects, mut rx) = mpsc::unbounded_channel::<Arc<PeerConnection>>();

        let manager = Arc::new_cyclic(|this| Self {
            connections: DashMap::new(),
            reconnecting: DashMap::new(),
            config,
            max_message_size,
            next_id: AtomicU64::new(1),
            disconnects,
            closed: AtomicBool::new(false),
            this: this.clone(),
        });

        let weak = Arc::downgrade(&manager);
        tokio::spawn(async move {
            while let Some(conn) = rx.recv().await {
                match weak.upgrade() {
                    Some(manager) => manager.handle_disconnect(conn),
                    None => {
                        conn.fail_pending();
                        break;
                    }
                }
            }
        });

        manager
    }

    /// The cached connection to `peer`, opening one if needed.
    pub async fn connection_for(&self, peer: &Peer) -> Result<Arc<PeerConnection>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        if let Some(conn) = self.connections.get(&peer.id) {
            return Ok(conn.clone());
        }

        let addr = peer.transport_addr().ok_or_else(|| Error::InvalidPeerMetadata {
            peer: peer.id.clone(),
        })?;
        let conn = self.open(peer.id.clone(), addr, true).await?;

        // Another caller may have connected concurrently; keep the first.
        let cached = self
            .connections
            .entry(peer.id.clone())
            .or_insert_with(|| conn.clone())
            .clone();
        if !Arc::ptr_eq(&cached, &conn) {
            conn.destroy();
        }
        Ok(cached)
    }

    /// Evict and destroy the connection to a departed peer, abandoning any
    /// reconnect in progress.
    pub fn on_peer_down(&self, peer: &PeerId) {
        if let Some((_, handle)) = self.reconnecting.remove(peer) {
            handle.abort();
            debug!(peer = %peer, "Abandoned reconnect");
        }
        if let Some((_, conn)) = self.connections.remove(peer) {
            conn.destroy();
            debug!(peer = %peer, "Evicted connection to departed peer");
        }
    }

    /// Destroy every connection. Later calls fail with `Error::Closed`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let reconnecting: Vec<PeerId> = self.reconnecting.iter().map(|e| e.key().clone()).collect();
        for peer in reconnecting {
            if let Some((_, handle)) = self.reconnecting.remove(&peer) {
                handle.abort();
            }
        }

        let peers: Vec<PeerId> = self.connections.iter().map(|e| e.key().clone()).collect();
        let count = peers.len();
        for peer in peers {
            if let Some((_, conn)) = self.connections.remove(&peer) {
                conn.destroy();
            }
        }
        info!(connections = count, "Connection manager closed");
    }

    /// Number of cached connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Whether a connection to `peer` is cached.
    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.connections.contains_key(peer)
    }

    async fn open(
        &self,
        peer: PeerId,
        addr: std::net::SocketAddr,
        reconnectable: bool,
    ) -> Result<Arc<PeerConnection>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        PeerConnection::connect(
            id,
            peer,
            addr,
            &self.config,
            self.max_message_size,
            reconnectable,
            self.disconnects.clone(),
        )
        .await
    }

    fn is_current(&self, conn: &Arc<PeerConnection>) -> bool {
        self.connections
            .get(conn.peer())
            .map_or(false, |cached| Arc::ptr_eq(cached.value(), conn))
    }

    fn handle_disconnect(&self, conn: Arc<PeerConnection>) {
        let current = self.is_current(&conn);
        let young = conn.age() < self.config.reconnect_grace;

        if current && young && conn.reconnectable() && !self.closed.load(Ordering::SeqCst) {
            let pending = conn.take_pending();
            debug!(peer = %conn.peer(), pending = pending.len(), "Reconnecting to peer");

            let this = self.this.clone();
            let peer = conn.peer().clone();
            let handle = tokio::spawn(async move {
                if let Some(manager) = this.upgrade() {
                    manager.reconnect(conn, pending).await;
                }
            });
            self.reconnecting.insert(peer.clone(), handle);
            // The attempt may already be over.
            self.reconnecting.remove_if(&peer, |_, h| h.is_finished());
            return;
        }

        if current {
            self.connections
                .remove_if(conn.peer(), |_, cached| Arc::ptr_eq(cached, &conn));
            debug!(peer = %conn.peer(), age_ms = conn.age().as_millis() as u64, "Evicted dropped connection");
        }
        conn.fail_pending();
    }

    async fn reconnect(&self, old: Arc<PeerConnection>, pending: Vec<PendingCall>) {
        let peer = old.peer().clone();
        let result = self.open(peer.clone(), old.addr(), false).await;

        match result {
            Ok(fresh) if self.is_current(&old) => {
                self.connections.insert(peer.clone(), fresh.clone());
                self.reconnecting.remove(&peer);
                fresh.replay(pending);
            }
            Ok(fresh) => {
                // Evicted while we were connecting.
                fresh.destroy();
                self.reconnecting.remove(&peer);
                fail_all(pending);
            }
            Err(e) => {
                // The closed connection stays cached until the peer is
                // reported down; callers see it closed and retry.
                debug!(peer = %peer, error = %e, "Reconnect failed");
                self.reconnecting.remove(&peer);
                fail_all(pending);
            }
        }
    }
}

fn fail_all(pending: Vec<PendingCall>) {
    for call in pending {
        call.fail(NetworkError::ConnectionClosed.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::rpc::{read_frame, write_frame, Message};
    use crate::types::{Call, PeerMeta, Reply};
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::net::TcpListener;

    const MAX: usize = 1024 * 1024;

    /// Echo server whose first connection hangs up after reading one frame.
    async fn flaky_server(accepted: Arc<AtomicUsize>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let n = accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    while let Ok(Some(msg)) = read_frame(&mut stream, MAX).await {
                        if n == 0 {
                            return;
                        }
                        if let Message::Request { seq, call } = msg {
                            let reply = Message::Response {
                                seq,
                                result: Ok(Reply::new(call.id, call.payload)),
                            };
                            if write_frame(&mut stream, &reply, MAX).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_connection_is_cached() {
        let accepted = Arc::new(AtomicUsize::new(1));
        let addr = flaky_server(accepted.clone()).await;
        let manager = ConnectionManager::new(ConnectionConfig::default(), MAX);
        let peer = Peer::listening_on(addr, 4);

        let first = manager.connection_for(&peer).await.unwrap();
        let second = manager.connection_for(&peer).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_metadata() {
        let manager = ConnectionManager::new(ConnectionConfig::default(), MAX);
        let peer = Peer::new(PeerId::new("ghost"), vec![1], PeerMeta::default());

        let err = manager.connection_for(&peer).await.unwrap_err();
        assert!(matches!(err, Error::InvalidPeerMetadata { .. }));
    }

    #[tokio::test]
    async fn test_young_connection_reconnects_and_replays() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let addr = flaky_server(accepted.clone()).await;
        let manager = ConnectionManager::new(ConnectionConfig::default(), MAX);
        let peer = Peer::listening_on(addr, 4);

        let conn = manager.connection_for(&peer).await.unwrap();
        let reply = tokio::time::timeout(
            Duration::from_secs(5),
            conn.request(Call::new("k", "echo").with_id(1).with_payload("x")),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(reply.id, Some(1));
        assert_eq!(accepted.load(Ordering::SeqCst), 2);

        let fresh = manager.connection_for(&peer).await.unwrap();
        assert!(!Arc::ptr_eq(&conn, &fresh));
        assert!(!fresh.reconnectable());
    }

    #[tokio::test]
    async fn test_old_connection_is_evicted() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let addr = flaky_server(accepted.clone()).await;
        let config = ConnectionConfig::default().with_reconnect_grace(Duration::ZERO);
        let manager = ConnectionManager::new(config, MAX);
        let peer = Peer::listening_on(addr, 4);

        let conn = manager.connection_for(&peer).await.unwrap();
        let err = tokio::time::timeout(Duration::from_secs(5), conn.request(Call::new("k", "echo")))
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.is_transport_failure());
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_peer_down_evicts() {
        let accepted = Arc::new(AtomicUsize::new(1));
        let addr = flaky_server(accepted).await;
        let manager = ConnectionManager::new(ConnectionConfig::default(), MAX);
        let peer = Peer::listening_on(addr, 4);

        let conn = manager.connection_for(&peer).await.unwrap();
        manager.on_peer_down(&peer.id);

        assert!(conn.is_closed());
        assert!(!manager.is_connected(&peer.id));
    }

    #[tokio::test]
    async fn test_close_rejects_new_connections() {
        let accepted = Arc::new(AtomicUsize::new(1));
        let addr = flaky_server(accepted).await;
        let manager = ConnectionManager::new(ConnectionConfig::default(), MAX);
        let peer = Peer::listening_on(addr, 4);

        let conn = manager.connection_for(&peer).await.unwrap();
        manager.close();

        assert!(conn.is_closed());
        assert_eq!(manager.connection_count(), 0);
        assert!(matches!(
            manager.connection_for(&peer).await,
            Err(Error::Closed)
        ));
    }

    #[tokio::test]
    async fn test_failed_reconnect_keeps_entry_until_peer_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Read one frame, then stop listening and hang up.
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_frame(&mut stream, MAX).await;
            drop(listener);
            drop(stream);
        });
        let manager = ConnectionManager::new(ConnectionConfig::default(), MAX);
        let peer = Peer::listening_on(addr, 4);

        let conn = manager.connection_for(&peer).await.unwrap();
        let err = tokio::time::timeout(Duration::from_secs(5), conn.request(Call::new("k", "echo")))
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.is_transport_failure());

        // Still cached, closed, until membership says otherwise.
        assert!(manager.is_connected(&peer.id));
        let cached = manager.connection_for(&peer).await.unwrap();
        assert!(Arc::ptr_eq(&cached, &conn));
        assert!(cached.is_closed());

        manager.on_peer_down(&peer.id);
        assert!(!manager.is_connected(&peer.id));
    }

    #[tokio::test]
    async fn test_peer_down_aborts_reconnect() {
        let manager = ConnectionManager::new(ConnectionConfig::default(), MAX);
        let peer = PeerId::new("slow");

        let (alive_tx, alive_rx) = tokio::sync::oneshot::channel::<()>();
        let attempt = tokio::spawn(async move {
            let _alive = alive_tx;
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        manager.reconnecting.insert(peer.clone(), attempt);

        manager.on_peer_down(&peer);

        // The attempt was dropped without completing.
        let outcome = tokio::time::timeout(Duration::from_secs(5), alive_rx)
            .await
            .unwrap();
        assert!(outcome.is_err());
        assert!(manager.reconnecting.is_empty());
    }
}
