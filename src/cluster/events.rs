//! Ring membership and ownership events.

use crate::types::{Peer, Point};

/// A contiguous ownership interval `(start, end]` assigned to `to`.
///
/// The interval may wrap past `u32::MAX` back to zero. When `start == end`
/// the interval covers the whole ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipRange {
    /// Exclusive lower bound.
    pub start: Point,
    /// Inclusive upper bound.
    pub end: Point,
    /// Peer now responsible for the interval.
    pub to: Peer,
}

impl OwnershipRange {
    pub fn new(start: Point, end: Point, to: Peer) -> Self {
        Self { start, end, to }
    }

    /// Whether `point` lies in `(start, end]`.
    pub fn contains(&self, point: Point) -> bool {
        range_contains(self.start, self.end, point)
    }
}

/// Membership test for the half-open ring interval `(start, end]`.
pub fn range_contains(start: Point, end: Point, point: Point) -> bool {
    if start < end {
        point > start && point <= end
    } else if start > end {
        point > start || point <= end
    } else {
        true
    }
}

/// Events emitted by the hash ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RingEvent {
    /// The local node joined the ring and can serve calls.
    Up,

    /// A peer joined the ring.
    PeerUp(Peer),

    /// A peer left the ring or was declared failed.
    PeerDown(Peer),

    /// Primary ownership of a range moved away from the local node.
    Move(OwnershipRange),

    /// A range became claimed or gained a new successor; seeds replicas.
    Steal(OwnershipRange),

    /// The membership layer reported a failure.
    Error(String),
}

impl RingEvent {
    /// Peer associated with this event, if any.
    pub fn peer(&self) -> Option<&Peer> {
        match self {
            RingEvent::PeerUp(peer) | RingEvent::PeerDown(peer) => Some(peer),
            RingEvent::Move(range) | RingEvent::Steal(range) => Some(&range.to),
            RingEvent::Up | RingEvent::Error(_) => None,
        }
    }

    /// Check if this is a membership change.
    pub fn is_membership(&self) -> bool {
        matches!(self, RingEvent::PeerUp(_) | RingEvent::PeerDown(_))
    }

    /// Log the event at a level matching its importance.
    pub fn log(&self) {
        match self {
            RingEvent::Up => tracing::info!("Ring up"),
            RingEvent::PeerUp(peer) => tracing::info!(peer = %peer.id, "Peer up"),
            RingEvent::PeerDown(peer) => tracing::info!(peer = %peer.id, "Peer down"),
            RingEvent::Move(range) => {
                tracing::trace!(start = range.start, end = range.end, to = %range.to.id, "Range moved");
            }
            RingEvent::Steal(range) => {
                tracing::trace!(start = range.start, end = range.end, to = %range.to.id, "Range stolen");
            }
            RingEvent::Error(reason) => tracing::warn!(%reason, "Ring error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PeerId, PeerMeta};

    fn peer() -> Peer {
        Peer::new(PeerId::new("p"), vec![1], PeerMeta::default())
    }

    #[test]
    fn test_range_boundaries() {
        let range = OwnershipRange::new(100, 200, peer());
        assert!(!range.contains(100));
        assert!(range.contains(101));
        assert!(range.contains(200));
        assert!(!range.contains(201));
    }

    #[test]
    fn test_wrapping_range() {
        let range = OwnershipRange::new(u32::MAX - 10, 5, peer());
        assert!(range.contains(u32::MAX));
        assert!(range.contains(0));
        assert!(range.contains(5));
        assert!(!range.contains(6));
        assert!(!range.contains(u32::MAX - 10));
    }

    #[test]
    fn test_degenerate_range_covers_ring() {
        let range = OwnershipRange::new(42, 42, peer());
        assert!(range.contains(0));
        assert!(range.contains(42));
        assert!(range.contains(u32::MAX));
    }

    #[test]
    fn test_event_peer() {
        let p = peer();
        assert_eq!(RingEvent::PeerUp(p.clone()).peer(), Some(&p));
        assert!(RingEvent::PeerDown(p.clone()).is_membership());
        assert!(!RingEvent::Move(OwnershipRange::new(1, 2, p)).is_membership());
        assert_eq!(RingEvent::Up.peer(), None);
    }
}
