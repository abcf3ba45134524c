//! Ownership and replica tracking driven by ring events.

use crate::cluster::events::RingEvent;
use crate::error::Result;
use crate::partitioning::ownership::OwnershipTracker;
use crate::partitioning::replica::ReplicaTracker;
use crate::partitioning::ring::Ring;
use crate::partitioning::tracker::Tracker;
use std::sync::Arc;

/// Options for [`KeyTracker::track`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackOptions {
    /// Also maintain a secondary placement for the key.
    pub replica: bool,
}

impl TrackOptions {
    pub fn replica() -> Self {
        Self { replica: true }
    }
}

/// Owns both tracker indexes for one node.
pub struct KeyTracker {
    ownership: OwnershipTracker,
    replicas: ReplicaTracker,
}

impl KeyTracker {
    pub fn new(ring: Arc<dyn Ring>) -> Self {
        Self {
            ownership: OwnershipTracker::new(ring.clone()),
            replicas: ReplicaTracker::new(ring),
        }
    }

    /// Watch a locally owned key.
    pub fn track(&self, key: &str, options: TrackOptions) -> Result<Arc<Tracker>> {
        let tracker = self.ownership.track(key, options.replica)?;
        if options.replica {
            self.replicas.track(tracker.clone());
        }
        Ok(tracker)
    }

    /// Watch a key owned by another member. The tracker fires once, with the
    /// local node as destination, when ownership of the key is stolen here.
    pub fn watch_replica(&self, key: &str) -> Result<Arc<Tracker>> {
        self.replicas.watch(self.ownership.next_id(), key)
    }

    /// Stop watching. Nothing is delivered for this tracker afterwards.
    pub fn end(&self, tracker: &Tracker) {
        self.replicas.end(tracker);
        self.ownership.cancel(tracker);
    }

    /// Apply one ring event. Replica recomputation triggered by the event is
    /// deferred until [`KeyTracker::run_deferred`].
    pub fn handle_event(&self, event: &RingEvent) {
        match event {
            RingEvent::Move(range) => {
                self.ownership.check(range);
                self.replicas.check(range);
            }
            RingEvent::Steal(range) => {
                self.replicas.check_steal(range);
                self.replicas.check(range);
            }
            RingEvent::PeerUp(_) => self.replicas.on_peer_up(),
            RingEvent::PeerDown(_) => self.replicas.on_peer_down(),
            RingEvent::Up | RingEvent::Error(_) => {}
        }
    }

    /// Second pass after an event: rebuild displaced replicas.
    pub fn run_deferred(&self) {
        self.replicas.run_deferred();
    }

    /// Drain everything, notifying pending trackers with no destination.
    pub fn clear(&self) -> usize {
        self.replicas.clear() + self.ownership.clear()
    }

    pub fn ownership(&self) -> &OwnershipTracker {
        &self.ownership
    }

    pub fn replicas(&self) -> &ReplicaTracker {
        &self.replicas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::events::OwnershipRange;
    use crate::partitioning::ring::ClusterRing;
    use crate::partitioning::tracker::{ReplicaEvent, TrackerState};
    use crate::types::{Peer, PeerId, PeerMeta, Point};
    use parking_lot::Mutex;

    fn peer(id: &str, points: Vec<Point>) -> Peer {
        Peer::new(PeerId::new(id), points, PeerMeta::default())
    }

    /// Feed every queued ring event through the tracker the way the node does.
    fn pump(rx: &mut tokio::sync::mpsc::UnboundedReceiver<RingEvent>, tracker: &KeyTracker) {
        while let Ok(event) = rx.try_recv() {
            tracker.handle_event(&event);
            tracker.run_deferred();
        }
    }

    #[test]
    fn test_moved_fires_before_replica_rebuilt() {
        let ring = Arc::new(ClusterRing::new(peer("a", vec![u32::MAX])));
        let b = peer("b", vec![1]);
        ring.peer_up(b.clone());

        let keys = KeyTracker::new(ring.clone());
        let key = (0..)
            .map(|i| format!("key-{}", i))
            .find(|k| ring.allocated_to_me(ring.hash(k)))
            .unwrap();
        let tracker = keys.track(&key, TrackOptions::replica()).unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let o = order.clone();
        tracker.on_moved(move |_| o.lock().push("moved"));
        let o = order.clone();
        tracker.on_replica(move |_| o.lock().push("replica"));

        // Covers both the key's hash and its replica point u32::MAX
        let c = peer("c", vec![0]);
        keys.handle_event(&RingEvent::Move(OwnershipRange::new(1, u32::MAX, c.clone())));
        assert_eq!(*order.lock(), vec!["moved"]);

        keys.run_deferred();
        assert_eq!(*order.lock(), vec!["moved", "replica"]);
        assert_eq!(tracker.state(), TrackerState::Fired);
    }

    #[test]
    fn test_replica_follows_second_peer() {
        let ring = Arc::new(ClusterRing::new(peer("a", vec![1000, 3_000_000_000])));
        let mut rx = ring.subscribe();
        let keys = KeyTracker::new(ring.clone());

        let key = (0..)
            .map(|i| format!("key-{}", i))
            .find(|k| {
                let h = ring.hash(k);
                h > 1000 && h <= 3_000_000_000
            })
            .unwrap();
        let tracker = keys.track(&key, TrackOptions::replica()).unwrap();
        let mut events = tracker.replica_events();

        let p = peer("p", vec![3_500_000_000]);
        ring.peer_up(p.clone());
        pump(&mut rx, &keys);
        let first = events.try_recv().unwrap();
        assert_eq!(first, ReplicaEvent::Established { peer: p.clone() });

        // p2 sits right after the local point at 3e9, so it becomes the next peer
        let p2 = peer("p2", vec![3_100_000_000]);
        ring.peer_up(p2.clone());
        pump(&mut rx, &keys);

        assert_eq!(ring.next(ring.hash(&key)), Some(p2.clone()));
        assert_eq!(
            events.try_recv().unwrap(),
            ReplicaEvent::Changed {
                peer: p2,
                previous: p
            }
        );
        assert_eq!(tracker.state(), TrackerState::Active);
    }

    #[test]
    fn test_end_silences_tracker() {
        let ring = Arc::new(ClusterRing::new(peer("a", vec![u32::MAX])));
        let keys = KeyTracker::new(ring.clone());
        let tracker = keys.track("k", TrackOptions::replica()).unwrap();
        let mut moved = tracker.moved();

        keys.end(&tracker);
        keys.handle_event(&RingEvent::Move(OwnershipRange::new(0, 0, peer("b", vec![1]))));
        ring.peer_up(peer("b", vec![1]));
        keys.handle_event(&RingEvent::PeerUp(peer("b", vec![1])));

        assert!(moved.try_recv().is_err());
        assert_eq!(tracker.state(), TrackerState::Cancelled);
        assert_eq!(keys.replicas().pending(), 0);
        assert_eq!(keys.replicas().placed(), 0);
    }

    #[test]
    fn test_clear_on_shutdown() {
        let ring = Arc::new(ClusterRing::new(peer("a", vec![u32::MAX])));
        let keys = KeyTracker::new(ring);
        let tracker = keys.track("k", TrackOptions::default()).unwrap();
        let mut moved = tracker.moved();

        assert_eq!(keys.clear(), 1);
        assert_eq!(moved.try_recv().unwrap(), None);
        assert!(keys.ownership().is_empty());
    }

    #[test]
    fn test_watch_replica_fires_when_owner_leaves() {
        let ring = Arc::new(ClusterRing::new(peer("a", vec![100])));
        let b = peer("b", vec![u32::MAX]);
        ring.peer_up(b.clone());
        let mut rx = ring.subscribe();
        let keys = KeyTracker::new(ring.clone());

        let key = (0..)
            .map(|i| format!("key-{}", i))
            .find(|k| !ring.allocated_to_me(ring.hash(k)))
            .unwrap();
        assert!(keys.track(&key, TrackOptions::default()).is_err());
        let watch = keys.watch_replica(&key).unwrap();
        let mut stolen = watch.moved();

        ring.peer_down(&b.id);
        pump(&mut rx, &keys);

        assert_eq!(stolen.try_recv().unwrap().map(|p| p.id), Some(PeerId::new("a")));
        assert_eq!(watch.state(), TrackerState::Fired);
        assert_eq!(keys.replicas().watches(), 0);
    }

    #[test]
    fn test_watch_replica_rejects_owned_key() {
        let ring = Arc::new(ClusterRing::new(peer("a", vec![u32::MAX])));
        let keys = KeyTracker::new(ring);
        assert!(matches!(
            keys.watch_replica("k"),
            Err(crate::error::Error::AllocatedLocally { .. })
        ));
    }
}
