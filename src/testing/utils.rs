use crate::cluster::events::RingEvent;
use crate::partitioning::hashring::HashRing;
use crate::partitioning::ring::Ring;
use crate::types::{Peer, PeerId, Point};
use parking_lot::{Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Keys scanned by [`MockRing::key_owned_by`] before giving up.
const KEY_SEARCH_LIMIT: usize = 1_000_000;

/// A ring whose membership is set directly by the test.
///
/// Unlike [`ClusterRing`](crate::partitioning::ClusterRing), changing the
/// member table emits nothing; tests drive events through [`MockRing::emit`].
pub struct MockRing {
    me: Peer,
    ring: RwLock<HashRing>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<RingEvent>>>,
}

impl MockRing {
    pub fn new(me: Peer) -> Self {
        let mut ring = HashRing::new();
        ring.add_peer(me.clone());
        Self {
            me,
            ring: RwLock::new(ring),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Replace every member except the local node.
    pub fn set_members(&self, members: Vec<Peer>) {
        let mut ring = HashRing::new();
        ring.add_peer(self.me.clone());
        for member in members {
            ring.add_peer(member);
        }
        *self.ring.write() = ring;
    }

    /// Deliver `event` to current subscribers. Returns how many got it.
    pub fn emit(&self, event: RingEvent) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        subscribers.len()
    }

    /// Find a `key-N` whose point is owned by `owner`.
    pub fn key_owned_by(&self, owner: &PeerId) -> Option<String> {
        let ring = self.ring.read();
        (0..KEY_SEARCH_LIMIT)
            .map(|i| format!("key-{}", i))
            .find(|key| {
                ring.owner_of(self.hash(key))
                    .map(|peer| &peer.id == owner)
                    .unwrap_or(false)
            })
    }
}

impl Ring for MockRing {
    fn allocated_to_me(&self, point: Point) -> bool {
        self.ring
            .read()
            .owner_of(point)
            .map(|peer| peer.id == self.me.id)
            .unwrap_or(true)
    }

    fn lookup(&self, point: Point) -> Peer {
        self.ring
            .read()
            .owner_of(point)
            .cloned()
            .unwrap_or_else(|| self.me.clone())
    }

    fn next(&self, point: Point) -> Option<Peer> {
        self.ring.read().next_peer(point).cloned()
    }

    fn peers(&self) -> Vec<Peer> {
        self.ring
            .read()
            .peers()
            .filter(|peer| peer.id != self.me.id)
            .cloned()
            .collect()
    }

    fn mymeta(&self) -> Peer {
        self.me.clone()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<RingEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }
}

/// Poll `action` until `predicate` accepts its output or `timeout` passes.
pub async fn wait_for_result<F, Fut, T, P>(mut action: F, predicate: P, timeout: Duration) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = T>,
    P: Fn(&T) -> bool,
{
    let start = Instant::now();
    let interval = Duration::from_millis(20);

    while start.elapsed() < timeout {
        let result = action().await;
        if predicate(&result) {
            return Some(result);
        }
        tokio::time::sleep(interval).await;
    }
    None
}

/// Poll a condition until it holds or `timeout` passes.
pub async fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    wait_for_result(|| std::future::ready(condition()), |ok| *ok, timeout)
        .await
        .is_some()
}
