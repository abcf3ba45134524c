//! Core types used throughout the router.

use crate::partitioning::hashring::peer_points;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// A position in the circular 32-bit hash space.
pub type Point = u32;

/// Correlation id carried by a call from the caller to the handler and back.
pub type RequestId = u64;

/// Identity of a cluster member, conventionally `address:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Create a peer id from any string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the peer id from the address the peer listens on.
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Metadata a peer advertises alongside its ring points.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMeta {
    /// Address the peer accepts routed calls on.
    pub transport_addr: Option<SocketAddr>,
}

/// Immutable snapshot of a cluster member.
///
/// A peer with the same id may reappear after churn with a different point
/// set, so snapshots are compared by value, not by id alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Unique peer identifier.
    pub id: PeerId,
    /// Ring points owned by this peer, sorted ascending.
    pub points: Vec<Point>,
    /// Advertised metadata.
    pub meta: PeerMeta,
}

impl Peer {
    /// Create a peer from explicit points. Points are sorted and deduplicated.
    pub fn new(id: PeerId, mut points: Vec<Point>, meta: PeerMeta) -> Self {
        points.sort_unstable();
        points.dedup();
        Self { id, points, meta }
    }

    /// Create a peer listening on `addr` with `point_count` derived ring points.
    pub fn listening_on(addr: SocketAddr, point_count: usize) -> Self {
        let id = PeerId::from_addr(addr);
        let points = peer_points(&id, point_count);
        Self::new(
            id,
            points,
            PeerMeta {
                transport_addr: Some(addr),
            },
        )
    }

    /// Address to open a connection to, if the peer advertised a usable one.
    pub fn transport_addr(&self) -> Option<SocketAddr> {
        self.meta
            .transport_addr
            .filter(|addr| addr.port() != 0 && !addr.ip().is_unspecified())
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// A routed call addressed by key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    /// Correlation id. Assigned by the router when the caller leaves it empty.
    pub id: Option<RequestId>,
    /// Logical key that decides which member handles the call.
    pub key: String,
    /// Command name used by the handler registry.
    pub cmd: String,
    /// Opaque request body.
    pub payload: Bytes,
}

impl Call {
    /// Create a call with an empty payload.
    pub fn new(key: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self {
            id: None,
            key: key.into(),
            cmd: cmd.into(),
            payload: Bytes::new(),
        }
    }

    /// Set the request body.
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Set an explicit correlation id.
    pub fn with_id(mut self, id: RequestId) -> Self {
        self.id = Some(id);
        self
    }
}

/// Result of a request/response call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    /// Correlation id of the call this answers.
    pub id: Option<RequestId>,
    /// Response body produced by the handler.
    pub payload: Bytes,
}

impl Reply {
    pub fn new(id: Option<RequestId>, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_points_sorted() {
        let peer = Peer::new(PeerId::new("a"), vec![30, 10, 20, 10], PeerMeta::default());
        assert_eq!(peer.points, vec![10, 20, 30]);
    }

    #[test]
    fn test_listening_on_derives_identity() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let peer = Peer::listening_on(addr, 10);

        assert_eq!(peer.id.as_str(), "127.0.0.1:9000");
        assert_eq!(peer.transport_addr(), Some(addr));
        assert!(!peer.points.is_empty());
        assert!(peer.points.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_unusable_transport_addr() {
        let mut peer = Peer::new(PeerId::new("x"), vec![1], PeerMeta::default());
        assert_eq!(peer.transport_addr(), None);

        peer.meta.transport_addr = Some("0.0.0.0:9000".parse().unwrap());
        assert_eq!(peer.transport_addr(), None);

        peer.meta.transport_addr = Some("127.0.0.1:0".parse().unwrap());
        assert_eq!(peer.transport_addr(), None);
    }

    #[test]
    fn test_call_builder() {
        let call = Call::new("user:1", "get").with_payload("body").with_id(7);
        assert_eq!(call.id, Some(7));
        assert_eq!(call.key, "user:1");
        assert_eq!(call.cmd, "get");
        assert_eq!(call.payload, Bytes::from_static(b"body"));
    }
}
