//! Key-addressed request routing over a consistent hash ring.
//!
//! Every member of a cluster claims a set of points on a 32-bit ring. A key
//! hashes to a point and belongs to the member owning that point. This crate
//! provides:
//! - **Routing** of request/response and fire-and-forget calls to the owner
//!   of a key, with retries while the ring is in flux
//! - **Ownership tracking** that tells the local node when a key it owns
//!   moves to another member
//! - **Replica tracking** that names the member holding a key's secondary
//!   copy and reports when that member changes
//!
//! # Example
//!
//! ```rust,no_run
//! use ringroute::{Call, CommandRegistry, NodeConfig, RingNode, TrackOptions};
//! use bytes::Bytes;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = CommandRegistry::new();
//!     registry.register_fn("get", |call: Call| async move {
//!         Ok(Bytes::from(format!("value of {}", call.key)))
//!     });
//!
//!     let config = NodeConfig::new("127.0.0.1:9000".parse()?)
//!         .with_seed_peers(vec!["127.0.0.1:9001".parse()?]);
//!     let node = RingNode::start(config, Arc::new(registry)).await?;
//!
//!     // Served locally or by whichever member owns the key
//!     let reply = node.request(Call::new("user:123", "get")).await?;
//!     println!("{:?}", reply.payload);
//!
//!     // Learn when an owned key moves away
//!     if node.allocated_to_me("user:123") {
//!         let tracker = node.track("user:123", TrackOptions::replica())?;
//!         tracker.on_moved(|to| println!("moved to {:?}", to.map(|p| &p.id)));
//!     }
//!
//!     node.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 RingNode                    │
//! │  • request / fire / fire_and_forget         │
//! │  • track / end                              │
//! │  • join / close                             │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼───────────────┐
//!     ▼               ▼               ▼
//! ┌─────────┐   ┌───────────┐   ┌────────────┐
//! │ Router  │   │ KeyTracker│   │ Connection │
//! │ + retry │   │ ownership │   │  Manager   │
//! │         │   │ + replica │   │            │
//! └─────────┘   └───────────┘   └────────────┘
//!      │              ▲               │
//!      ▼              │ RingEvent     ▼
//! ┌─────────────────────────┐   ┌────────────┐
//! │   ClusterRing (Ring)    │   │ TCP frames │
//! └─────────────────────────┘   └────────────┘
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod network;
pub mod node;
pub mod partitioning;
pub mod router;
pub mod testing;
pub mod types;

pub use config::{ConnectionConfig, NodeConfig, RetryConfig};
pub use error::{Error, NetworkError, Result};
pub use node::RingNode;
pub use types::{Call, Peer, PeerId, PeerMeta, Point, Reply, RequestId};

// Re-export ring types
pub use cluster::{OwnershipRange, RingEvent};
pub use partitioning::{
    ClusterRing, HashRing, KeyTracker, ReplicaEvent, ReplicaStatus, Ring, TrackOptions, Tracker,
    TrackerState,
};

// Re-export routing types
pub use router::{
    handler_fn, CommandRegistry, Handler, HandlerRegistry, RequestIdGenerator, RequestIds, RequestRouter,
};
