//! Wire messages exchanged between peers.
//!
//! Every frame is a 4-byte big-endian length followed by a bincode-encoded
//! [`Message`]. Calls are multiplexed over one connection and correlated by
//! a per-connection sequence number.

use crate::error::{NetworkError, Result};
use crate::types::{Call, Peer, Reply};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Network message wrapper for all communication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Routed call expecting the handler's reply.
    Request { seq: u64, call: Call },

    /// Routed call expecting only a delivery acknowledgement.
    Fire { seq: u64, call: Call },

    /// Handler outcome for a `Request`. Errors travel as their display text.
    Response {
        seq: u64,
        result: std::result::Result<Reply, String>,
    },

    /// Delivery acknowledgement for a `Fire`.
    Ack { seq: u64 },

    /// A node asking a seed to admit it to the ring.
    Join(Peer),

    /// The seed's member list, itself included.
    Welcome(Vec<Peer>),
}

impl Message {
    /// Sequence number for call traffic.
    pub fn seq(&self) -> Option<u64> {
        match self {
            Message::Request { seq, .. }
            | Message::Fire { seq, .. }
            | Message::Response { seq, .. }
            | Message::Ack { seq } => Some(*seq),
            Message::Join(_) | Message::Welcome(_) => None,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request { .. } => "request",
            Message::Fire { .. } => "fire",
            Message::Response { .. } => "response",
            Message::Ack { .. } => "ack",
            Message::Join(_) => "join",
            Message::Welcome(_) => "welcome",
        }
    }
}

/// Encode a message to bytes.
pub fn encode_message(msg: &Message) -> std::result::Result<Vec<u8>, bincode::Error> {
    bincode::serialize(msg)
}

/// Decode a message from bytes.
pub fn decode_message(data: &[u8]) -> std::result::Result<Message, bincode::Error> {
    bincode::deserialize(data)
}

/// Frame a message with length prefix for TCP transmission.
pub fn frame_message(msg: &Message) -> std::result::Result<Vec<u8>, bincode::Error> {
    let data = encode_message(msg)?;
    let len = data.len() as u32;

    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&data);

    Ok(framed)
}

/// Frame a message, rejecting it if the body exceeds `max_size`.
pub fn frame_bounded(msg: &Message, max_size: usize) -> Result<Vec<u8>> {
    let framed = frame_message(msg)?;
    let size = framed.len() - 4;
    if size > max_size {
        return Err(NetworkError::MessageTooLarge {
            size,
            max: max_size,
        }
        .into());
    }
    Ok(framed)
}

/// Write one framed message.
pub async fn write_frame<W>(writer: &mut W, msg: &Message, max_size: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let framed = frame_bounded(msg, max_size)?;
    write_framed(writer, &framed).await
}

/// Write bytes already produced by [`frame_bounded`].
pub async fn write_framed<W>(writer: &mut W, framed: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(framed)
        .await
        .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
    Ok(())
}

/// Read one framed message. Returns `None` when the peer closed the stream
/// cleanly between frames.
pub async fn read_frame<R>(reader: &mut R, max_size: usize) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetworkError::Io(e).into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(NetworkError::MessageTooLarge {
            size: len,
            max: max_size,
        }
        .into());
    }

    let mut data = vec![0u8; len];
    reader
        .read_exact(&mut data)
        .await
        .map_err(|e| NetworkError::ReceiveFailed(e.to_string()))?;

    Ok(Some(decode_message(&data)?))
}
