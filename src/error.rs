//! Error types for the router.

use crate::types::PeerId;
use std::io;
use thiserror::Error;

/// Result type alias for router operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the router.
#[derive(Error, Debug)]
pub enum Error {
    /// The resolved owner does not advertise a usable transport address.
    #[error("peer {peer} has invalid transport metadata")]
    InvalidPeerMetadata { peer: PeerId },

    /// Ownership drift or transport failures exceeded the retry ceiling.
    #[error("retried {retries} times without reaching the owner")]
    RetryExhausted { retries: u32 },

    /// A tracker was requested for a key this node does not own.
    #[error("key {key:?} is not allocated to this node")]
    NotOwnedLocally { key: String },

    /// A replica watch was requested for a key this node already owns.
    #[error("key {key:?} is allocated to this node")]
    AllocatedLocally { key: String },

    /// No handler is registered for the call.
    #[error("message does not match any pattern")]
    NoHandler,

    /// A local handler failed; forwarded verbatim to the caller.
    #[error("handler error: {0}")]
    Handler(String),

    /// A handler on the owning peer failed.
    #[error("remote error: {0}")]
    Remote(String),

    /// The node has been closed.
    #[error("node closed")]
    Closed,

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the failure came from the transport and may succeed on a
    /// fresh attempt once the ring view has caught up.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            Error::Network(
                NetworkError::ConnectionFailed { .. }
                    | NetworkError::ConnectionClosed
                    | NetworkError::SendFailed(_)
                    | NetworkError::ReceiveFailed(_)
                    | NetworkError::Timeout
                    | NetworkError::Io(_)
            )
        )
    }
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Failed to send message.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Failed to receive message.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// The peer did not answer in time.
    #[error("request timed out")]
    Timeout,

    /// A frame exceeded the configured maximum size.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// The peer answered with an unexpected message.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}
