//! One-shot watches on key ownership.
//!
//! A tracker is registered at the hash point of a key the local node owns.
//! When a `Move` range covering that point is delivered, the tracker is
//! removed from the index and notified with the new owner.

use crate::cluster::events::OwnershipRange;
use crate::error::{Error, Result};
use crate::partitioning::index::PointIndex;
use crate::partitioning::ring::Ring;
use crate::partitioning::tracker::{Tracker, TrackerId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Index of active ownership watches.
pub struct OwnershipTracker {
    /// Ring used to hash keys and check ownership.
    ring: Arc<dyn Ring>,

    /// Active trackers by hash point.
    index: Mutex<PointIndex<Arc<Tracker>>>,

    /// Id generator for new trackers.
    next_id: AtomicU64,
}

impl OwnershipTracker {
    /// Create an empty tracker index over `ring`.
    pub fn new(ring: Arc<dyn Ring>) -> Self {
        Self {
            ring,
            index: Mutex::new(PointIndex::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Watch `key`. Fails if the local node does not own it.
    pub fn track(&self, key: &str, replicated: bool) -> Result<Arc<Tracker>> {
        let point = self.ring.hash(key);
        if !self.ring.allocated_to_me(point) {
            return Err(Error::NotOwnedLocally {
                key: key.to_string(),
            });
        }

        let id = self.next_id();
        let tracker = Arc::new(Tracker::new(id, key.to_string(), point, replicated));
        self.index.lock().insert(point, tracker.clone());

        trace!(tracker = id, key, point, "Tracking key");
        Ok(tracker)
    }

    /// Allocate a tracker id. Shared with replica watches so ids stay unique
    /// per node.
    pub(crate) fn next_id(&self) -> TrackerId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Remove a tracker before it fires. A no-op once it fired.
    pub fn cancel(&self, tracker: &Tracker) -> bool {
        self.index
            .lock()
            .remove_where(tracker.point(), |t| t.id() == tracker.id());
        tracker.cancel()
    }

    /// Fire every tracker inside `range` with the range's destination.
    /// Returns the trackers that fired, clockwise from the range start.
    pub fn check(&self, range: &OwnershipRange) -> Vec<Arc<Tracker>> {
        let consumed = self.index.lock().consume_range(range.start, range.end);

        let mut fired = Vec::with_capacity(consumed.len());
        for (point, tracker) in consumed {
            if tracker.fire(Some(&range.to)) {
                trace!(tracker = tracker.id(), point, to = %range.to.id, "Key moved");
                fired.push(tracker);
            }
        }
        fired
    }

    /// Drain the index, notifying every pending tracker with no destination.
    pub fn clear(&self) -> usize {
        let drained = self.index.lock().drain();

        let mut notified = 0;
        for (_, tracker) in drained {
            if tracker.fire(None) {
                notified += 1;
            }
        }
        notified
    }

    /// Number of trackers waiting to fire.
    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockRing;
    use crate::types::{Peer, PeerId, PeerMeta, Point};
    use std::sync::atomic::AtomicUsize;

    fn peer(id: &str, points: Vec<Point>) -> Peer {
        Peer::new(PeerId::new(id), points, PeerMeta::default())
    }

    fn setup() -> (Arc<MockRing>, OwnershipTracker) {
        let ring = Arc::new(MockRing::new(peer("a", vec![u32::MAX])));
        let tracker = OwnershipTracker::new(ring.clone());
        (ring, tracker)
    }

    fn counter(tracker: &Tracker) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        tracker.on_moved(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[test]
    fn test_track_requires_local_ownership() {
        let (ring, trackers) = setup();
        let b = peer("b", vec![u32::MAX / 2]);
        ring.set_members(vec![b]);

        let key = ring.key_owned_by(&PeerId::new("b")).unwrap();
        let err = trackers.track(&key, false).unwrap_err();
        assert!(matches!(err, Error::NotOwnedLocally { .. }));
        assert!(trackers.is_empty());
    }

    #[test]
    fn test_fires_on_range_end_not_start() {
        let (ring, trackers) = setup();
        let key = "user:1";
        let point = ring.hash(key);
        let to = peer("b", vec![1]);

        let tracker = trackers.track(key, false).unwrap();
        let count = counter(&tracker);

        // start is exclusive
        assert!(trackers
            .check(&OwnershipRange::new(point, point.wrapping_add(10), to.clone()))
            .is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // end is inclusive
        let fired = trackers.check(&OwnershipRange::new(point.wrapping_sub(10), point, to.clone()));
        assert_eq!(fired.len(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // a repeated delivery is a no-op
        trackers.check(&OwnershipRange::new(point.wrapping_sub(10), point, to));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(trackers.is_empty());
    }

    #[test]
    fn test_moved_carries_destination() {
        let (ring, trackers) = setup();
        let key = "user:2";
        let point = ring.hash(key);
        let to = peer("b", vec![1]);

        let tracker = trackers.track(key, false).unwrap();
        let mut rx = tracker.moved();
        trackers.check(&OwnershipRange::new(point.wrapping_sub(1), point, to.clone()));

        assert_eq!(rx.try_recv().unwrap(), Some(to));
    }

    #[test]
    fn test_cancel_prevents_notification() {
        let (ring, trackers) = setup();
        let key = "user:3";
        let point = ring.hash(key);

        let tracker = trackers.track(key, false).unwrap();
        let count = counter(&tracker);
        assert!(trackers.cancel(&tracker));
        assert!(!trackers.cancel(&tracker));

        trackers.check(&OwnershipRange::new(point.wrapping_sub(1), point, peer("b", vec![1])));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_shared_key_fires_all_watchers() {
        let (ring, trackers) = setup();
        let key = "user:4";
        let point = ring.hash(key);

        let first = trackers.track(key, false).unwrap();
        let second = trackers.track(key, false).unwrap();
        let c1 = counter(&first);
        let c2 = counter(&second);

        let fired = trackers.check(&OwnershipRange::new(point.wrapping_sub(1), point, peer("b", vec![1])));
        assert_eq!(fired.len(), 2);
        assert_eq!(c1.load(Ordering::SeqCst), 1);
        assert_eq!(c2.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clear_notifies_with_no_destination() {
        let (_ring, trackers) = setup();
        let first = trackers.track("k1", false).unwrap();
        let second = trackers.track("k2", false).unwrap();
        let mut rx1 = first.moved();
        let mut rx2 = second.moved();

        assert_eq!(trackers.clear(), 2);
        assert!(trackers.is_empty());
        assert_eq!(rx1.try_recv().unwrap(), None);
        assert_eq!(rx2.try_recv().unwrap(), None);
    }
}
