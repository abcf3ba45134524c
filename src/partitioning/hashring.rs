//! Consistent hash ring over a 32-bit point space.
//!
//! Each peer claims a small set of points on the ring. A key belongs to the
//! peer holding the first point at or after the key's hash, wrapping around
//! past `u32::MAX`.

use crate::cluster::events::{OwnershipRange, RingEvent};
use crate::types::{Peer, PeerId, Point};
use std::collections::BTreeMap;
use std::hash::Hasher;
use std::ops::Bound::{Excluded, Unbounded};
use twox_hash::XxHash32;

/// Hash a key onto the ring.
pub fn hash_key(key: &[u8]) -> Point {
    let mut hasher = XxHash32::with_seed(0);
    hasher.write(key);
    hasher.finish() as Point
}

/// Derive `count` ring points for a peer from its id.
pub fn peer_points(id: &PeerId, count: usize) -> Vec<Point> {
    let mut points: Vec<Point> = (0..count)
        .map(|i| hash_key(format!("{}:{}", id, i).as_bytes()))
        .collect();
    points.sort_unstable();
    points.dedup();
    points
}

/// A consistent hash ring mapping points to peers.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    /// Ring points mapped to the peer that claimed them.
    points: BTreeMap<Point, PeerId>,

    /// Member snapshots by id.
    peers: BTreeMap<PeerId, Peer>,
}

/// Ring after a membership change plus the ownership events it implies
/// for one observer.
#[derive(Debug, Clone)]
pub struct RingTransition {
    pub ring: HashRing,
    pub events: Vec<RingEvent>,
}

impl HashRing {
    /// Create a new empty hash ring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of peers in the ring.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Get the number of claimed points.
    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Check if a peer is in the ring.
    pub fn contains_peer(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    /// Get a peer snapshot by id.
    pub fn get_peer(&self, id: &PeerId) -> Option<&Peer> {
        self.peers.get(id)
    }

    /// Iterate over all members ordered by id.
    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Add a peer to the ring.
    ///
    /// A peer reappearing with a different point set replaces its previous
    /// snapshot. Points already claimed by another peer stay with that peer.
    /// Returns false if the identical snapshot was already present.
    pub fn add_peer(&mut self, peer: Peer) -> bool {
        if let Some(existing) = self.peers.get(&peer.id) {
            if *existing == peer {
                return false;
            }
            let id = peer.id.clone();
            self.remove_peer(&id);
        }

        for &point in &peer.points {
            self.points.entry(point).or_insert_with(|| peer.id.clone());
        }
        self.peers.insert(peer.id.clone(), peer);
        true
    }

    /// Remove a peer from the ring, returning its snapshot.
    pub fn remove_peer(&mut self, id: &PeerId) -> Option<Peer> {
        let peer = self.peers.remove(id)?;
        for point in &peer.points {
            if self.points.get(point) == Some(id) {
                self.points.remove(point);
            }
        }
        Some(peer)
    }

    /// The ring point responsible for `point`: the first claimed point at or
    /// after it, wrapping to the lowest point.
    pub fn owning_point(&self, point: Point) -> Option<Point> {
        self.points
            .range(point..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(&p, _)| p)
    }

    /// The peer responsible for `point`.
    pub fn owner_of(&self, point: Point) -> Option<&Peer> {
        let owning = self.owning_point(point)?;
        self.points.get(&owning).and_then(|id| self.peers.get(id))
    }

    /// The claimed point immediately before `point`, wrapping to the highest.
    pub fn predecessor_point(&self, point: Point) -> Option<Point> {
        self.points
            .range(..point)
            .next_back()
            .or_else(|| self.points.iter().next_back())
            .map(|(&p, _)| p)
    }

    /// The claimed point immediately after `point`, wrapping to the lowest.
    pub fn successor_point(&self, point: Point) -> Option<Point> {
        self.points
            .range((Excluded(point), Unbounded))
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(&p, _)| p)
    }

    /// The first peer clockwise after the owner of `point` that is not the
    /// owner itself. None when the ring has fewer than two peers.
    pub fn next_peer(&self, point: Point) -> Option<&Peer> {
        let owning = self.owning_point(point)?;
        let owner = self.points.get(&owning)?;

        self.points
            .range((Excluded(owning), Unbounded))
            .chain(self.points.range(..=owning))
            .find(|(_, id)| *id != owner)
            .and_then(|(_, id)| self.peers.get(id))
    }

    /// Get the primary owner for a key.
    pub fn get_primary(&self, key: &[u8]) -> Option<&Peer> {
        self.owner_of(hash_key(key))
    }

    /// Count how many of `sample_size` synthetic keys land on each peer.
    pub fn get_distribution(&self, sample_size: usize) -> BTreeMap<PeerId, usize> {
        let mut distribution = BTreeMap::new();

        for i in 0..sample_size {
            let key = format!("sample_key_{}", i);
            if let Some(owner) = self.get_primary(key.as_bytes()) {
                *distribution.entry(owner.id.clone()).or_insert(0) += 1;
            }
        }

        distribution
    }

    /// Compute the ring after `joined` is added, and the events `me` observes.
    ///
    /// Every range that `me` owned and the new peer now owns becomes a
    /// `Move`. Every local point whose clockwise successor peer changed
    /// becomes a `Steal` over the range ending at that point.
    pub fn plan_join(&self, joined: &Peer, me: &PeerId) -> RingTransition {
        let mut next = self.clone();
        next.add_peer(joined.clone());

        let mut events = Vec::new();
        if joined.id == *me {
            return RingTransition { ring: next, events };
        }

        for &point in &joined.points {
            if next.points.get(&point) != Some(&joined.id) {
                continue;
            }
            let previously_mine = self.owner_of(point).map_or(false, |o| o.id == *me);
            if !previously_mine {
                continue;
            }
            if let Some(start) = next.predecessor_point(point) {
                events.push(RingEvent::Move(OwnershipRange::new(
                    start,
                    point,
                    joined.clone(),
                )));
            }
        }

        events.extend(self.successor_changes(&next, me));
        RingTransition { ring: next, events }
    }

    /// Compute the ring after `departed` leaves, and the events `me` observes.
    ///
    /// Every range `me` inherits becomes a `Steal` to `me`. Every local point
    /// whose clockwise successor peer changed becomes a `Steal` to the new
    /// successor.
    pub fn plan_leave(&self, departed: &PeerId, me: &PeerId) -> RingTransition {
        let mut next = self.clone();
        let mut events = Vec::new();

        let gone = match next.remove_peer(departed) {
            Some(gone) if gone.id != *me => gone,
            _ => return RingTransition { ring: next, events },
        };

        if let Some(local) = next.get_peer(me) {
            for &point in &gone.points {
                if self.points.get(&point) != Some(departed) {
                    continue;
                }
                let inherits = next.owner_of(point).map_or(false, |o| o.id == *me);
                if !inherits {
                    continue;
                }
                if let Some(start) = self.predecessor_point(point) {
                    events.push(RingEvent::Steal(OwnershipRange::new(
                        start,
                        point,
                        local.clone(),
                    )));
                }
            }
        }

        events.extend(self.successor_changes(&next, me));
        RingTransition { ring: next, events }
    }

    fn successor_changes(&self, next: &HashRing, me: &PeerId) -> Vec<RingEvent> {
        let local = match next.get_peer(me) {
            Some(local) => local,
            None => return Vec::new(),
        };

        let mut events = Vec::new();
        for &point in &local.points {
            if next.points.get(&point) != Some(me) {
                continue;
            }
            let after = match next.next_peer(point) {
                Some(after) => after,
                None => continue,
            };
            let before = self.next_peer(point).map(|p| &p.id);
            if before == Some(&after.id) {
                continue;
            }
            if let Some(start) = next.predecessor_point(point) {
                events.push(RingEvent::Steal(OwnershipRange::new(
                    start,
                    point,
                    after.clone(),
                )));
            }
        }
        events
    }
}
