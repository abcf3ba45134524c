//! End-to-end tests for ring nodes over real TCP connections.
//!
//! These tests cover:
//! - Joining two nodes and the ownership moves that follow
//! - Replica establishment once a second member appears
//! - Ownership notifications surviving bursts of ring changes
//! - Replica watches firing when a remote owner leaves
//! - Shutdown notifying trackers

#[cfg(test)]
mod tests {
    use crate::config::NodeConfig;
    use crate::error::Error;
    use crate::node::RingNode;
    use crate::partitioning::{hash_key, HashRing, ReplicaEvent, Ring, TrackOptions};
    use crate::router::CommandRegistry;
    use crate::testing::wait_for;
    use crate::types::{Call, Peer, PeerId, PeerMeta};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn start_node() -> Arc<RingNode> {
        RingNode::start(NodeConfig::default(), Arc::new(CommandRegistry::new()))
            .await
            .unwrap()
    }

    /// Ring as it will look once both nodes know each other.
    fn joined_ring(a: &RingNode, b: &RingNode) -> HashRing {
        let mut ring = HashRing::new();
        ring.add_peer(a.mymeta());
        ring.add_peer(b.mymeta());
        ring
    }

    fn key_owned_after_join(ring: &HashRing, owner: &PeerId) -> String {
        (0..100_000)
            .map(|i| format!("user:{}", i))
            .find(|key| {
                ring.owner_of(hash_key(key.as_bytes()))
                    .map(|p| &p.id == owner)
                    .unwrap_or(false)
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_join_moves_tracked_key_and_establishes_replica() {
        let a = start_node().await;
        let b = start_node().await;
        let after = joined_ring(&a, &b);

        // A owns everything until it joins; pick a key that B will take.
        let moving = key_owned_after_join(&after, &b.whoami());
        assert!(a.allocated_to_me(&moving));
        let a_tracker = a.track(&moving, TrackOptions::default()).unwrap();
        let moved = a_tracker.moved();

        // B has no peers yet, so its replica waits.
        let b_tracker = b.track(&moving, TrackOptions::replica()).unwrap();
        let mut replica_events = b_tracker.replica_events();

        a.join(&[b.local_addr()]).await.unwrap();

        let to = timeout(WAIT, moved).await.unwrap().unwrap();
        assert_eq!(to.map(|p| p.id), Some(b.whoami()));

        let event = timeout(WAIT, replica_events.recv()).await.unwrap().unwrap();
        assert!(matches!(&event, ReplicaEvent::Established { peer } if peer.id == a.whoami()));

        assert_eq!(a.peers().len(), 1);
        assert_eq!(b.peers().len(), 1);
        assert!(!a.allocated_to_me(&moving));

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_join_is_symmetric() {
        let a = start_node().await;
        let b = start_node().await;
        let c = start_node().await;

        b.join(&[a.local_addr()]).await.unwrap();
        c.join(&[a.local_addr()]).await.unwrap();

        // C learned B from A's welcome and introduced itself.
        assert!(wait_for(|| b.peers().len() == 2, WAIT).await);
        assert_eq!(a.peers().len(), 2);
        assert_eq!(c.peers().len(), 2);

        for key in ["x", "y", "z"] {
            let point = a.ring().hash(key);
            let owner = a.ring().lookup(point).id;
            assert_eq!(b.ring().lookup(point).id, owner);
            assert_eq!(c.ring().lookup(point).id, owner);
        }

        for node in [a, b, c] {
            node.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_join_unreachable_seed_fails() {
        let a = start_node().await;
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);

        assert!(a.join(&[dead]).await.is_err());
        assert!(a.peers().is_empty());
        a.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_down_returns_ownership() {
        let a = start_node().await;
        let b = start_node().await;
        a.join(&[b.local_addr()]).await.unwrap();

        let after = joined_ring(&a, &b);
        let key = key_owned_after_join(&after, &b.whoami());
        assert!(!a.allocated_to_me(&key));

        a.peer_down(&b.whoami());
        assert!(a.allocated_to_me(&key));
        assert!(a.peers().is_empty());
        assert!(!a.connections().is_connected(&b.whoami()));

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_notifies_trackers_and_rejects_calls() {
        let a = start_node().await;
        let tracker = a.track("session:1", TrackOptions::default()).unwrap();
        let moved = tracker.moved();

        a.close().await.unwrap();
        assert!(a.is_closed());

        let to = timeout(WAIT, moved).await.unwrap().unwrap();
        assert!(to.is_none());

        assert!(matches!(
            a.request(Call::new("session:1", "get")).await,
            Err(Error::Closed)
        ));
        assert!(matches!(
            a.track("session:2", TrackOptions::default()),
            Err(Error::Closed)
        ));

        // Closing twice is fine.
        a.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_moved_survives_burst_of_ring_changes() {
        let a = start_node().await;
        let tracker = a.track("burst:key", TrackOptions::default()).unwrap();
        let moved = tracker.moved();
        let point = a.ring().hash("burst:key");

        // The taker lands exactly on the key; the burst follows before the
        // event loop gets a chance to run.
        a.ring()
            .peer_up(Peer::new(PeerId::new("taker"), vec![point], PeerMeta::default()));
        (0..1500u32)
            .map(|i| i.wrapping_mul(2_654_435).wrapping_add(1))
            .filter(|p| *p != point)
            .enumerate()
            .for_each(|(i, p)| {
                a.ring().peer_up(Peer::new(
                    PeerId::new(format!("burst-{}", i)),
                    vec![p],
                    PeerMeta::default(),
                ));
            });

        let to = timeout(Duration::from_secs(10), moved).await.unwrap().unwrap();
        assert_eq!(to.map(|p| p.id), Some(PeerId::new("taker")));

        a.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_replica_watch_fires_when_owner_leaves() {
        let a = start_node().await;
        let b = start_node().await;
        a.join(&[b.local_addr()]).await.unwrap();

        let after = joined_ring(&a, &b);
        let key = key_owned_after_join(&after, &b.whoami());
        assert!(matches!(
            a.track(&key, TrackOptions::default()),
            Err(Error::NotOwnedLocally { .. })
        ));
        let watch = a.watch_replica(&key).unwrap();
        let stolen = watch.moved();

        a.peer_down(&b.whoami());

        let to = timeout(WAIT, stolen).await.unwrap().unwrap();
        assert_eq!(to.map(|p| p.id), Some(a.whoami()));
        assert!(matches!(
            a.watch_replica(&key),
            Err(Error::AllocatedLocally { .. })
        ));

        a.close().await.unwrap();
        b.close().await.unwrap();
    }
}
