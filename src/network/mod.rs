//! Network communication layer.

pub mod connection;
pub mod manager;
pub mod rpc;
pub mod server;

pub use connection::{CallKind, PeerConnection, PendingCall};
pub use manager::ConnectionManager;
pub use rpc::Message;
pub use server::{MessageHandler, NetworkServer};
