//! Cluster membership events and the join handshake.

pub mod events;
pub mod join;

pub use events::{OwnershipRange, RingEvent};
pub use join::join_seed;
