//! Standing secondary placement for tracked keys.
//!
//! A replicated key is indexed at the first local ring point after its hash,
//! not at the hash itself. Any `Move` or `Steal` range covering that point
//! means the secondary may have changed; the entry is pulled out and
//! recomputed in a deferred pass so that primary notifications for the same
//! event are delivered first.
//!
//! The same module keeps one-shot watches on keys owned elsewhere. A watch
//! sits at the key's hash and fires once a `Steal` range hands that point to
//! the local node.

use crate::cluster::events::OwnershipRange;
use crate::error::{Error, Result};
use crate::partitioning::index::PointIndex;
use crate::partitioning::ring::Ring;
use crate::partitioning::tracker::{ReplicaStatus, Tracker, TrackerId};
use crate::types::{Peer, Point};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

/// The index point for a key hashed to `hash` on a peer owning `points`:
/// the first point strictly greater than `hash`, wrapping to the first one.
pub fn replica_point(hash: Point, points: &[Point]) -> Option<Point> {
    points
        .iter()
        .copied()
        .find(|&p| p > hash)
        .or_else(|| points.first().copied())
}

#[derive(Default)]
struct ReplicaState {
    /// Placed replicas by replica point.
    index: PointIndex<Arc<Tracker>>,
    /// Waiting for another member to exist.
    pending: Vec<Arc<Tracker>>,
    /// Displaced by a ring change, recomputed on the next deferred pass.
    deferred: Vec<Arc<Tracker>>,
    /// Watches on remote keys by hash point.
    watches: PointIndex<Arc<Tracker>>,
}

/// Maintains the secondary peer of every replicated tracker.
pub struct ReplicaTracker {
    ring: Arc<dyn Ring>,
    state: Mutex<ReplicaState>,
}

impl ReplicaTracker {
    pub fn new(ring: Arc<dyn Ring>) -> Self {
        Self {
            ring,
            state: Mutex::new(ReplicaState::default()),
        }
    }

    /// Start maintaining a replica for `tracker`. Queued until a peer exists.
    pub fn track(&self, tracker: Arc<Tracker>) {
        if !tracker.wants_replica() {
            return;
        }
        self.place_all(vec![tracker]);
    }

    /// A member joined: place every queued replica.
    pub fn on_peer_up(&self) {
        let pending = std::mem::take(&mut self.state.lock().pending);
        if !pending.is_empty() {
            trace!(count = pending.len(), "Placing queued replicas");
        }
        self.place_all(pending);
    }

    /// A member left. Once no other member remains, every replica goes back
    /// to waiting and the next join re-establishes it from scratch.
    pub fn on_peer_down(&self) {
        if !self.ring.peers().is_empty() {
            return;
        }

        let mut state = self.state.lock();
        let mut requeued: Vec<Arc<Tracker>> =
            state.index.drain().into_iter().map(|(_, t)| t).collect();
        requeued.append(&mut state.deferred);

        for tracker in requeued {
            if tracker.wants_replica() {
                tracker.set_replica_pending();
                state.pending.push(tracker);
            }
        }
        trace!(count = state.pending.len(), "Replicas waiting for a peer");
    }

    /// Pull every replica whose point lies in `range` for recomputation.
    /// Returns how many were displaced.
    pub fn check(&self, range: &OwnershipRange) -> usize {
        let mut state = self.state.lock();
        let consumed = state.index.consume_range(range.start, range.end);

        let mut displaced = 0;
        for (_, tracker) in consumed {
            if tracker.displace_replica().is_some() {
                state.deferred.push(tracker);
                displaced += 1;
            }
        }
        displaced
    }

    /// Watch `key`, owned by another member, until the local node steals it.
    pub fn watch(&self, id: TrackerId, key: &str) -> Result<Arc<Tracker>> {
        let point = self.ring.hash(key);
        if self.ring.allocated_to_me(point) {
            return Err(Error::AllocatedLocally {
                key: key.to_string(),
            });
        }

        let tracker = Arc::new(Tracker::new(id, key.to_string(), point, false));
        self.state.lock().watches.insert(point, tracker.clone());

        trace!(tracker = id, key, point, "Watching remote key");
        Ok(tracker)
    }

    /// Fire every watch inside a stolen `range`. Returns the watches that
    /// fired, clockwise from the range start.
    pub fn check_steal(&self, range: &OwnershipRange) -> Vec<Arc<Tracker>> {
        let consumed = self
            .state
            .lock()
            .watches
            .consume_range(range.start, range.end);

        let mut fired = Vec::with_capacity(consumed.len());
        for (point, tracker) in consumed {
            if tracker.fire(Some(&range.to)) {
                trace!(tracker = tracker.id(), point, "Remote key stolen");
                fired.push(tracker);
            }
        }
        fired
    }

    /// Recompute replicas displaced by earlier ring changes.
    pub fn run_deferred(&self) {
        let deferred = std::mem::take(&mut self.state.lock().deferred);
        self.place_all(deferred);
    }

    /// Stop maintaining the replica of `tracker`.
    pub fn end(&self, tracker: &Tracker) {
        let mut state = self.state.lock();
        if let ReplicaStatus::Placed { point, .. } = tracker.replica() {
            state.index.remove_where(point, |t| t.id() == tracker.id());
        }
        state.pending.retain(|t| t.id() != tracker.id());
        state.deferred.retain(|t| t.id() != tracker.id());
        state
            .watches
            .remove_where(tracker.point(), |t| t.id() == tracker.id());
    }

    /// Forget every replica and notify open watches with no destination.
    /// Returns how many watches were notified.
    pub fn clear(&self) -> usize {
        let watches = {
            let mut state = self.state.lock();
            state.index.drain();
            state.pending.clear();
            state.deferred.clear();
            state.watches.drain()
        };

        watches
            .into_iter()
            .filter(|(_, tracker)| tracker.fire(None))
            .count()
    }

    /// Number of placed replicas.
    pub fn placed(&self) -> usize {
        self.state.lock().index.len()
    }

    /// Number of replicas waiting for a peer.
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Number of open watches on remote keys.
    pub fn watches(&self) -> usize {
        self.state.lock().watches.len()
    }

    fn place_all(&self, trackers: Vec<Arc<Tracker>>) {
        let my_points = self.ring.mymeta().points;
        let mut placements: Vec<(Arc<Tracker>, Point, Peer)> = Vec::new();

        {
            let mut state = self.state.lock();
            for tracker in trackers {
                if !tracker.wants_replica() {
                    continue;
                }
                let target = replica_point(tracker.point(), &my_points)
                    .zip(self.ring.next(tracker.point()));
                match target {
                    Some((point, peer)) => {
                        state.index.insert(point, tracker.clone());
                        placements.push((tracker, point, peer));
                    }
                    None => {
                        tracker.set_replica_pending();
                        state.pending.push(tracker);
                    }
                }
            }
        }

        for (tracker, point, peer) in placements {
            trace!(tracker = tracker.id(), point, peer = %peer.id, "Replica placed");
            tracker.place_replica(point, peer);
        }
    }
}
