//! BitTorrent handshake serialization and deserialization

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::torrent::{InfoHash, TorrentError};

/// Fixed size of a BitTorrent handshake on the wire.
pub const HANDSHAKE_LENGTH: usize = 68;

/// Protocol identifier exchanged in every handshake.
pub const PROTOCOL_NAME: &str = "BitTorrent protocol";

/// BitTorrent peer identifier.
///
/// 20-byte identifier for peers in the BitTorrent network.
/// Used in handshakes and tracker communication to identify clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Creates peer ID from 20-byte array.
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Returns peer ID as byte array reference.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generates a peer ID: client tag prefix followed by random bytes.
    pub fn generate(prefix: &str) -> Self {
        let mut id = [0u8; 20];
        let tag = prefix.as_bytes();
        let tag_len = tag.len().min(8);
        id[..tag_len].copy_from_slice(&tag[..tag_len]);
        for byte in &mut id[tag_len..] {
            *byte = rand::random();
        }
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.escape_ascii())
    }
}

/// Peer handshake message following BEP 3.
///
/// Fixed 68-byte exchange that opens every peer connection: protocol
/// string, reserved extension bytes, info hash and peer ID.
#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    /// Creates a handshake with no extension bits set.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Serializes the handshake into its 68-byte wire form.
    pub fn encode(&self) -> [u8; HANDSHAKE_LENGTH] {
        let mut buf = [0u8; HANDSHAKE_LENGTH];
        buf[0] = PROTOCOL_NAME.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_NAME.as_bytes());
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(self.info_hash.as_bytes());
        buf[48..68].copy_from_slice(self.peer_id.as_bytes());
        buf
    }

    /// Deserializes a 68-byte handshake.
    ///
    /// A protocol string length other than 19 shifts the whole layout, so
    /// it is rejected before any field is read.
    ///
    /// # Errors
    ///
    /// - `TorrentError::ProtocolViolation` - Unexpected protocol string length
    pub fn decode(buf: &[u8; HANDSHAKE_LENGTH]) -> Result<Self, TorrentError> {
        let protocol_len = buf[0] as usize;
        if protocol_len != PROTOCOL_NAME.len() {
            return Err(TorrentError::ProtocolViolation {
                reason: format!("handshake protocol string length {protocol_len} (expected 19)"),
            });
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Self {
            reserved,
            info_hash: InfoHash::new(info_hash),
            peer_id: PeerId::new(peer_id),
        })
    }
}
