//! Length-prefixed message framing rules and message classification

use std::fmt;

use bytes::Bytes;

use crate::torrent::TorrentError;

/// Largest frame length accepted from a peer.
///
/// Anything above this (or negative) is treated as a framing violation and
/// tears down the connection.
pub const MAX_FRAME_LENGTH: i32 = 1 << 15;

/// Wire message ids defined by BEP 3, plus the DHT port extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have,
    Bitfield,
    Request,
    Piece,
    Cancel,
    Port,
    Unknown(u8),
}

impl MessageId {
    /// Classifies the id byte that follows the length prefix.
    pub fn from_byte(id: u8) -> Self {
        match id {
            0 => MessageId::Choke,
            1 => MessageId::Unchoke,
            2 => MessageId::Interested,
            3 => MessageId::NotInterested,
            4 => MessageId::Have,
            5 => MessageId::Bitfield,
            6 => MessageId::Request,
            7 => MessageId::Piece,
            8 => MessageId::Cancel,
            9 => MessageId::Port,
            other => MessageId::Unknown(other),
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Choke => write!(f, "choke"),
            MessageId::Unchoke => write!(f, "unchoke"),
            MessageId::Interested => write!(f, "interested"),
            MessageId::NotInterested => write!(f, "not interested"),
            MessageId::Have => write!(f, "have"),
            MessageId::Bitfield => write!(f, "bitfield"),
            MessageId::Request => write!(f, "request"),
            MessageId::Piece => write!(f, "piece"),
            MessageId::Cancel => write!(f, "cancel"),
            MessageId::Port => write!(f, "port"),
            MessageId::Unknown(id) => write!(f, "unknown(0x{id:02x})"),
        }
    }
}

/// One inbound frame after the length prefix has been consumed.
///
/// Frames are classified for observability only; no message changes
/// transfer state yet.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    KeepAlive,
    Message { id: MessageId, payload: Bytes },
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::KeepAlive => write!(f, "keep-alive"),
            Frame::Message { id, payload } if payload.is_empty() => write!(f, "{id}"),
            Frame::Message { id, payload } => write!(f, "{id} ({} bytes)", payload.len()),
        }
    }
}

/// Checks a frame length prefix against the protocol limits.
///
/// # Errors
///
/// - `TorrentError::ProtocolViolation` - Negative or oversized length
pub fn validate_frame_length(length: i32) -> Result<(), TorrentError> {
    if length < 0 {
        return Err(TorrentError::ProtocolViolation {
            reason: format!("negative frame length {length}"),
        });
    }
    if length > MAX_FRAME_LENGTH {
        return Err(TorrentError::ProtocolViolation {
            reason: format!("frame length {length} exceeds {MAX_FRAME_LENGTH}"),
        });
    }
    Ok(())
}
