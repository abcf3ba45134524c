//! Configuration types for a ring node.

use crate::router::RequestIdGenerator;
use std::net::SocketAddr;
use std::time::Duration;

/// Default number of ring points each peer claims.
pub const DEFAULT_POINTS_PER_PEER: usize = 10;

/// Largest frame accepted on the wire.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Main configuration for a ring node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address to bind the listener to. Port 0 picks a free port.
    pub bind_addr: SocketAddr,

    /// Address advertised to peers. Defaults to the bound address.
    pub advertise_addr: Option<SocketAddr>,

    /// Members to join once the node is up.
    pub seed_peers: Vec<SocketAddr>,

    /// Ring points claimed by each peer.
    pub points_per_peer: usize,

    /// Retry policy for routed calls.
    pub retry: RetryConfig,

    /// Peer connection behavior.
    pub connection: ConnectionConfig,

    /// Maximum size of a single frame in bytes.
    pub max_message_size: usize,

    /// Correlation id source for calls routed by this node. The built-in
    /// wrapping sequence is used when unset.
    pub request_id_generator: Option<RequestIdGenerator>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            advertise_addr: None,
            seed_peers: Vec::new(),
            points_per_peer: DEFAULT_POINTS_PER_PEER,
            retry: RetryConfig::default(),
            connection: ConnectionConfig::default(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            request_id_generator: None,
        }
    }
}

impl NodeConfig {
    /// Create a new configuration bound to the given address.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Set the advertised address.
    pub fn with_advertise_addr(mut self, addr: SocketAddr) -> Self {
        self.advertise_addr = Some(addr);
        self
    }

    /// Set seed peers to join at startup.
    pub fn with_seed_peers(mut self, seeds: Vec<SocketAddr>) -> Self {
        self.seed_peers = seeds;
        self
    }

    /// Set the number of ring points per peer.
    pub fn with_points_per_peer(mut self, points: usize) -> Self {
        self.points_per_peer = points;
        self
    }

    /// Set the retry policy.
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the connection configuration.
    pub fn with_connection_config(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Set the maximum frame size.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the correlation id source.
    pub fn with_request_id_generator(mut self, generator: RequestIdGenerator) -> Self {
        self.request_id_generator = Some(generator);
        self
    }

    /// Check invariants that would otherwise surface as confusing runtime failures.
    pub fn validate(&self) -> Result<(), String> {
        if self.points_per_peer == 0 {
            return Err("points_per_peer must be at least 1".to_string());
        }
        if self.max_message_size < 64 {
            return Err("max_message_size is too small".to_string());
        }
        Ok(())
    }
}

/// Retry policy for routed calls.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,

    /// Fixed delay before each retry.
    pub retry_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

impl RetryConfig {
    /// Set the retry ceiling.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the retry delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

/// Peer connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,

    /// Age under which a dropped connection is reconnected in place.
    /// Older connections are evicted instead.
    pub reconnect_grace: Duration,

    /// Upper bound on waiting for a single reply. None waits indefinitely.
    pub request_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            reconnect_grace: Duration::from_secs(10),
            request_timeout: None,
        }
    }
}

impl ConnectionConfig {
    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the reconnect grace window.
    pub fn with_reconnect_grace(mut self, grace: Duration) -> Self {
        self.reconnect_grace = grace;
        self
    }

    /// Set the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}
