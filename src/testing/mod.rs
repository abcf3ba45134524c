//! Testing utilities for ring nodes.
//!
//! [`MockRing`] is a [`Ring`](crate::partitioning::Ring) whose member table
//! is set directly, for unit tests of the trackers and the router. The
//! integration modules start real nodes on loopback ports.
//!
//! # Example
//!
//! ```rust,ignore
//! use ringroute::testing::MockRing;
//! use ringroute::{Peer, PeerId, PeerMeta};
//!
//! let ring = MockRing::new(Peer::new(PeerId::new("a"), vec![u32::MAX], PeerMeta::default()));
//! ring.set_members(vec![Peer::new(PeerId::new("b"), vec![1 << 31], PeerMeta::default())]);
//! let key = ring.key_owned_by(&PeerId::new("b")).unwrap();
//! ```

mod node_e2e_tests;
mod utils;

pub use utils::{wait_for, wait_for_result, MockRing};
