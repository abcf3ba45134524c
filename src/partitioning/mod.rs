//! Key placement on the hash ring and tracking of ownership changes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       KeyTracker                             │
//! │  ┌──────────────────────────┐  ┌──────────────────────────┐ │
//! │  │    OwnershipTracker      │  │     ReplicaTracker       │ │
//! │  │  PointIndex @ hash(key)  │  │  PointIndex @ next local │ │
//! │  │  one-shot "moved"        │  │  point after hash(key)   │ │
//! │  └──────────────────────────┘  └──────────────────────────┘ │
//! │                 ▲ Move / Steal / PeerUp / PeerDown           │
//! └─────────────────┼───────────────────────────────────────────┘
//!                   │
//! ┌─────────────────┴───────────────────────────────────────────┐
//! │  Ring (ClusterRing)  →  HashRing: u32 point → peer            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use ringroute::partitioning::{ClusterRing, KeyTracker, Ring, TrackOptions};
//! use std::sync::Arc;
//!
//! let ring = Arc::new(ClusterRing::new(me));
//! let keys = KeyTracker::new(ring.clone());
//!
//! let tracker = keys.track("user:123", TrackOptions::replica())?;
//! tracker.on_moved(|to| println!("moved to {:?}", to));
//! tracker.on_replica(|event| println!("replica on {}", event.peer()));
//! ```

pub mod hashring;
pub mod index;
pub mod ownership;
pub mod replica;
pub mod ring;
pub mod tracker;
pub mod tracking;

pub use hashring::{hash_key, peer_points, HashRing, RingTransition};
pub use index::PointIndex;
pub use ownership::OwnershipTracker;
pub use replica::{replica_point, ReplicaTracker};
pub use ring::{ClusterRing, Ring};
pub use tracker::{ReplicaEvent, ReplicaStatus, Tracker, TrackerId, TrackerState};
pub use tracking::{KeyTracker, TrackOptions};
