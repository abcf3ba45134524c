//! Handles returned when tracking a key.

use crate::types::{Peer, Point};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Unique id of a tracker within one node.
pub type TrackerId = u64;

/// Lifecycle of the primary watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    /// Waiting for the key to move.
    Active,
    /// The moved notification was delivered.
    Fired,
    /// Ended by the caller before it fired.
    Cancelled,
}

/// Notification about the secondary placement of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaEvent {
    /// A secondary was designated where there was none.
    Established { peer: Peer },
    /// The secondary was recomputed after the ring changed.
    Changed { peer: Peer, previous: Peer },
}

impl ReplicaEvent {
    /// The currently designated secondary.
    pub fn peer(&self) -> &Peer {
        match self {
            ReplicaEvent::Established { peer } | ReplicaEvent::Changed { peer, .. } => peer,
        }
    }
}

/// Where the secondary placement of a key stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaStatus {
    /// Tracked without a replica.
    Disabled,
    /// Waiting for another member to exist.
    Pending,
    /// Indexed at `point` with `peer` as the secondary.
    Placed { point: Point, peer: Peer },
    /// Pulled from the index by a ring change, awaiting recomputation.
    Displaced { previous: Peer },
    /// No longer maintained.
    Ended,
}

type MovedCallback = Box<dyn FnOnce(Option<&Peer>) + Send>;
type ReplicaCallback = Arc<dyn Fn(&ReplicaEvent) + Send + Sync>;

struct TrackerInner {
    state: TrackerState,
    moved_to: Option<Peer>,
    on_moved: Vec<MovedCallback>,
    on_replica: Vec<ReplicaCallback>,
    replica: ReplicaStatus,
}

/// A watch on one key.
///
/// The moved notification fires at most once, carrying the new owner, or no
/// peer when the node shuts down. Replica notifications may fire many times
/// until the tracker is ended.
pub struct Tracker {
    id: TrackerId,
    key: String,
    point: Point,
    inner: Mutex<TrackerInner>,
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Tracker")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("point", &self.point)
            .field("state", &inner.state)
            .field("replica", &inner.replica)
            .finish()
    }
}

impl Tracker {
    pub(crate) fn new(id: TrackerId, key: String, point: Point, replicated: bool) -> Self {
        let replica = if replicated {
            ReplicaStatus::Pending
        } else {
            ReplicaStatus::Disabled
        };
        Self {
            id,
            key,
            point,
            inner: Mutex::new(TrackerInner {
                state: TrackerState::Active,
                moved_to: None,
                on_moved: Vec::new(),
                on_replica: Vec::new(),
                replica,
            }),
        }
    }

    pub fn id(&self) -> TrackerId {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Hash point of the key.
    pub fn point(&self) -> Point {
        self.point
    }

    pub fn state(&self) -> TrackerState {
        self.inner.lock().state
    }

    pub fn replica(&self) -> ReplicaStatus {
        self.inner.lock().replica.clone()
    }

    /// Subscribe to the moved notification.
    ///
    /// Subscribing after the tracker fired invokes the callback right away;
    /// subscribing after cancellation never invokes it.
    pub fn on_moved<F>(&self, callback: F)
    where
        F: FnOnce(Option<&Peer>) + Send + 'static,
    {
        let mut inner = self.inner.lock();
        match inner.state {
            TrackerState::Active => inner.on_moved.push(Box::new(callback)),
            TrackerState::Fired => {
                let to = inner.moved_to.clone();
                drop(inner);
                callback(to.as_ref());
            }
            TrackerState::Cancelled => {}
        }
    }

    /// Subscribe to replica notifications.
    pub fn on_replica<F>(&self, callback: F)
    where
        F: Fn(&ReplicaEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        if inner.replica != ReplicaStatus::Ended {
            inner.on_replica.push(Arc::new(callback));
        }
    }

    /// Channel form of [`Tracker::on_moved`]. The sender is dropped without a
    /// value if the tracker is cancelled.
    pub fn moved(&self) -> oneshot::Receiver<Option<Peer>> {
        let (tx, rx) = oneshot::channel();
        self.on_moved(move |to| {
            let _ = tx.send(to.cloned());
        });
        rx
    }

    /// Channel form of [`Tracker::on_replica`].
    pub fn replica_events(&self) -> mpsc::UnboundedReceiver<ReplicaEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.on_replica(move |event| {
            let _ = tx.send(event.clone());
        });
        rx
    }

    /// Deliver the moved notification. Returns false if it was not active.
    pub(crate) fn fire(&self, to: Option<&Peer>) -> bool {
        let callbacks = {
            let mut inner = self.inner.lock();
            if inner.state != TrackerState::Active {
                return false;
            }
            inner.state = TrackerState::Fired;
            inner.moved_to = to.cloned();
            std::mem::take(&mut inner.on_moved)
        };
        for callback in callbacks {
            callback(to);
        }
        true
    }

    /// End the tracker: drops subscribers and stops replica maintenance.
    /// Returns false if it had already fired or been cancelled.
    pub(crate) fn cancel(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.on_moved.clear();
        inner.on_replica.clear();
        if inner.replica != ReplicaStatus::Disabled {
            inner.replica = ReplicaStatus::Ended;
        }
        if inner.state != TrackerState::Active {
            return false;
        }
        inner.state = TrackerState::Cancelled;
        true
    }

    /// Whether replica maintenance is still wanted.
    pub(crate) fn wants_replica(&self) -> bool {
        !matches!(
            self.inner.lock().replica,
            ReplicaStatus::Disabled | ReplicaStatus::Ended
        )
    }

    /// Forget the current placement and wait for a member to appear.
    pub(crate) fn set_replica_pending(&self) {
        let mut inner = self.inner.lock();
        if !matches!(inner.replica, ReplicaStatus::Disabled | ReplicaStatus::Ended) {
            inner.replica = ReplicaStatus::Pending;
        }
    }

    /// Mark the placement as pulled from the index. Returns the point it was
    /// placed at.
    pub(crate) fn displace_replica(&self) -> Option<Point> {
        let mut inner = self.inner.lock();
        match std::mem::replace(&mut inner.replica, ReplicaStatus::Ended) {
            ReplicaStatus::Placed { point, peer } => {
                inner.replica = ReplicaStatus::Displaced { previous: peer };
                Some(point)
            }
            other => {
                inner.replica = other;
                None
            }
        }
    }

    /// Record a new placement and notify subscribers.
    pub(crate) fn place_replica(&self, point: Point, peer: Peer) -> Option<ReplicaEvent> {
        let (event, callbacks) = {
            let mut inner = self.inner.lock();
            let event = match &inner.replica {
                ReplicaStatus::Pending => ReplicaEvent::Established { peer: peer.clone() },
                ReplicaStatus::Displaced { previous } | ReplicaStatus::Placed { peer: previous, .. } => {
                    ReplicaEvent::Changed {
                        peer: peer.clone(),
                        previous: previous.clone(),
                    }
                }
                ReplicaStatus::Disabled | ReplicaStatus::Ended => return None,
            };
            inner.replica = ReplicaStatus::Placed { point, peer };
            (event, inner.on_replica.clone())
        };
        for callback in &callbacks {
            callback(&event);
        }
        Some(event)
    }
}
