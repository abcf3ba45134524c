//! The hash ring as seen by one node.
//!
//! [`Ring`] is the boundary the router and trackers consume. A membership
//! protocol drives [`ClusterRing`] through `peer_up` / `peer_down`; the ring
//! turns every change into ordered [`RingEvent`]s for the local node.

use crate::cluster::events::RingEvent;
use crate::partitioning::hashring::{hash_key, HashRing};
use crate::types::{Peer, PeerId, Point};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

/// Ownership queries and membership events for the local node.
pub trait Ring: Send + Sync + 'static {
    /// Map a key to its ring point.
    fn hash(&self, key: &str) -> Point {
        hash_key(key.as_bytes())
    }

    /// Whether the local node owns `point`.
    fn allocated_to_me(&self, point: Point) -> bool;

    /// Current owner of `point`.
    fn lookup(&self, point: Point) -> Peer;

    /// The first peer clockwise after the owner of `point`, if any.
    fn next(&self, point: Point) -> Option<Peer>;

    /// Known members other than the local node.
    fn peers(&self) -> Vec<Peer>;

    /// Snapshot of the local node.
    fn mymeta(&self) -> Peer;

    /// Id of the local node.
    fn whoami(&self) -> PeerId {
        self.mymeta().id
    }

    /// Receive ring events from now on. Nothing is dropped: a slow
    /// subscriber only buffers.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<RingEvent>;
}

/// In-process ring over an explicit member table.
pub struct ClusterRing {
    me: Peer,
    ring: RwLock<HashRing>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<RingEvent>>>,
    up: AtomicBool,
}

impl ClusterRing {
    /// Create a ring containing only the local node.
    pub fn new(me: Peer) -> Self {
        let mut ring = HashRing::new();
        ring.add_peer(me.clone());
        Self {
            me,
            ring: RwLock::new(ring),
            subscribers: Mutex::new(Vec::new()),
            up: AtomicBool::new(false),
        }
    }

    /// Announce that the local node is part of the ring. Only the first
    /// call emits `Up`.
    pub fn mark_up(&self) {
        if !self.up.swap(true, Ordering::SeqCst) {
            self.emit(RingEvent::Up);
        }
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    /// Add or refresh a member. Returns false if nothing changed.
    pub fn peer_up(&self, peer: Peer) -> bool {
        if peer.id == self.me.id {
            return false;
        }

        let mut ring = self.ring.write();
        if ring.get_peer(&peer.id) == Some(&peer) {
            return false;
        }

        let transition = ring.plan_join(&peer, &self.me.id);
        *ring = transition.ring;
        debug!(peer = %peer.id, events = transition.events.len(), members = ring.peer_count(), "Peer joined ring");

        // Sent under the lock so concurrent changes stay ordered.
        for event in transition.events {
            self.emit(event);
        }
        self.emit(RingEvent::PeerUp(peer));
        true
    }

    /// Remove a member. Returns its last snapshot if it was known.
    pub fn peer_down(&self, id: &PeerId) -> Option<Peer> {
        if *id == self.me.id {
            return None;
        }

        let mut ring = self.ring.write();
        let departed = ring.get_peer(id)?.clone();

        let transition = ring.plan_leave(id, &self.me.id);
        *ring = transition.ring;
        debug!(peer = %id, events = transition.events.len(), members = ring.peer_count(), "Peer left ring");

        for event in transition.events {
            self.emit(event);
        }
        self.emit(RingEvent::PeerDown(departed.clone()));
        Some(departed)
    }

    /// Report a membership failure to subscribers.
    pub fn report_error(&self, reason: impl Into<String>) {
        self.emit(RingEvent::Error(reason.into()));
    }

    /// Deliver to every live subscriber, forgetting the ones that hung up.
    fn emit(&self, event: RingEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// All members including the local node.
    pub fn members(&self) -> Vec<Peer> {
        self.ring.read().peers().cloned().collect()
    }

    /// Copy of the current ring.
    pub fn snapshot(&self) -> HashRing {
        self.ring.read().clone()
    }
}

impl Ring for ClusterRing {
    fn allocated_to_me(&self, point: Point) -> bool {
        self.ring
            .read()
            .owner_of(point)
            .map_or(true, |owner| owner.id == self.me.id)
    }

    fn lookup(&self, point: Point) -> Peer {
        self.ring
            .read()
            .owner_of(point)
            .cloned()
            .unwrap_or_else(|| self.me.clone())
    }

    fn next(&self, point: Point) -> Option<Peer> {
        self.ring.read().next_peer(point).cloned()
    }

    fn peers(&self) -> Vec<Peer> {
        self.ring
            .read()
            .peers()
            .filter(|p| p.id != self.me.id)
            .cloned()
            .collect()
    }

    fn mymeta(&self) -> Peer {
        self.me.clone()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<RingEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::events::OwnershipRange;
    use crate::types::PeerMeta;

    fn peer(id: &str, points: Vec<Point>) -> Peer {
        Peer::new(PeerId::new(id), points, PeerMeta::default())
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<RingEvent>) -> Vec<RingEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_alone_owns_everything() {
        let ring = ClusterRing::new(peer("a", vec![100]));
        assert!(ring.allocated_to_me(0));
        assert!(ring.allocated_to_me(u32::MAX));
        assert!(ring.next(5).is_none());
        assert!(ring.peers().is_empty());
        assert_eq!(ring.whoami(), PeerId::new("a"));
    }

    #[test]
    fn test_mark_up_once() {
        let ring = ClusterRing::new(peer("a", vec![100]));
        let mut rx = ring.subscribe();
        ring.mark_up();
        ring.mark_up();
        assert_eq!(drain(&mut rx), vec![RingEvent::Up]);
        assert!(ring.is_up());
    }

    #[test]
    fn test_peer_up_emits_move_then_peer_up() {
        let ring = ClusterRing::new(peer("a", vec![100, 300]));
        let mut rx = ring.subscribe();
        let b = peer("b", vec![200]);

        assert!(ring.peer_up(b.clone()));
        assert!(!ring.peer_up(b.clone()));

        let events = drain(&mut rx);
        assert!(events.contains(&RingEvent::Move(OwnershipRange::new(100, 200, b.clone()))));
        assert_eq!(events.last(), Some(&RingEvent::PeerUp(b.clone())));

        assert!(!ring.allocated_to_me(150));
        assert_eq!(ring.lookup(150), b);
        assert_eq!(ring.next(250), Some(b));
    }

    #[test]
    fn test_peer_down_emits_steal_then_peer_down() {
        let me = peer("a", vec![100, 300]);
        let ring = ClusterRing::new(me.clone());
        let b = peer("b", vec![200]);
        ring.peer_up(b.clone());
        let mut rx = ring.subscribe();

        assert_eq!(ring.peer_down(&b.id), Some(b.clone()));
        assert_eq!(ring.peer_down(&b.id), None);

        let events = drain(&mut rx);
        assert!(events.contains(&RingEvent::Steal(OwnershipRange::new(100, 200, me))));
        assert_eq!(events.last(), Some(&RingEvent::PeerDown(b)));
        assert!(ring.allocated_to_me(150));
    }

    #[test]
    fn test_self_is_ignored() {
        let me = peer("a", vec![100]);
        let ring = ClusterRing::new(me.clone());
        assert!(!ring.peer_up(me.clone()));
        assert!(ring.peer_down(&me.id).is_none());
        assert_eq!(ring.members(), vec![me]);
    }

    #[test]
    fn test_burst_of_changes_is_not_dropped() {
        let ring = ClusterRing::new(peer("a", vec![u32::MAX]));
        let mut rx = ring.subscribe();

        for i in 0..1500u32 {
            ring.peer_up(peer(&format!("p{}", i), vec![i * 1000 + 1]));
        }

        let joined = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, RingEvent::PeerUp(_)))
            .count();
        assert_eq!(joined, 1500);
    }

    #[test]
    fn test_dropped_subscriber_is_forgotten() {
        let ring = ClusterRing::new(peer("a", vec![100]));
        let rx = ring.subscribe();
        let mut live = ring.subscribe();
        drop(rx);

        ring.mark_up();
        assert_eq!(ring.subscribers.lock().len(), 1);
        assert_eq!(drain(&mut live), vec![RingEvent::Up]);
    }
}
