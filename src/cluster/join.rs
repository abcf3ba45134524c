//! Bootstrap handshake with a seed member.

use crate::error::{NetworkError, Result};
use crate::network::rpc::{read_frame, write_frame, Message};
use crate::types::Peer;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Introduce `me` to the seed at `addr` and return the members it knows.
///
/// Uses a dedicated short-lived connection; routed traffic goes through the
/// connection manager instead.
pub async fn join_seed(
    addr: SocketAddr,
    me: &Peer,
    connect_timeout: Duration,
    max_message_size: usize,
) -> Result<Vec<Peer>> {
    let mut stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| NetworkError::ConnectionFailed {
            addr: addr.to_string(),
            reason: "connect timeout".to_string(),
        })?
        .map_err(|e| NetworkError::ConnectionFailed {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
    stream.set_nodelay(true).ok();

    write_frame(&mut stream, &Message::Join(me.clone()), max_message_size).await?;

    match read_frame(&mut stream, max_message_size).await? {
        Some(Message::Welcome(members)) => {
            debug!(seed = %addr, members = members.len(), "Joined through seed");
            Ok(members)
        }
        Some(other) => Err(NetworkError::UnexpectedMessage(other.kind().to_string()).into()),
        None => Err(NetworkError::ConnectionClosed.into()),
    }
}
