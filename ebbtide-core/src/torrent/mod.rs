//! BitTorrent swarm state: metainfo, trackers, peers and the dispatch queue

pub mod dispatch;
pub mod engine;
pub mod metainfo;
pub mod peer;
pub mod protocol;
pub mod tracker;

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

pub use dispatch::PeerDispatch;
pub use engine::{PieceFlag, PieceState, Torrent, TorrentSnapshot};
pub use metainfo::{FileEntry, Metainfo};
pub use peer::{Peer, PeerSnapshot, PeerStatus};
pub use protocol::{Frame, Handshake, MessageId, PeerId};
pub use tracker::{
    AnnounceClient, AnnounceRequest, AnnounceResponse, HttpAnnounceClient, Tracker,
    TrackerProtocol, TrackerSnapshot, TrackerStatus,
};

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the canonically re-encoded info dictionary from a
/// torrent file. Used to uniquely identify torrents across the BitTorrent
/// network and as the session registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

// Serialized as a 40-character hex string so snapshot files stay readable.
impl Serialize for InfoHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        hex::encode(self.0).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for InfoHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(serde::de::Error::custom)?;
        let hash: [u8; 20] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("info hash must be 20 bytes"))?;
        Ok(Self(hash))
    }
}

/// Lifecycle of a torrent in the session.
///
/// `Completed` is reachable only by restoring a snapshot that recorded it;
/// the engine never enters it on its own since piece download is not wired
/// up yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TorrentStatus {
    #[default]
    Stopped,
    Started,
    Completed,
}

impl fmt::Display for TorrentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentStatus::Stopped => write!(f, "stopped"),
            TorrentStatus::Started => write!(f, "started"),
            TorrentStatus::Completed => write!(f, "completed"),
        }
    }
}

/// Errors that can occur during torrent operations.
///
/// Covers descriptor parsing, tracker announces and peer connections.
/// Per-peer and per-tracker failures are absorbed into the owning entity's
/// status; only descriptor loading propagates to callers.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Failed to decode torrent file: {reason}")]
    Decode { reason: String },

    #[error("Invalid torrent file: {reason}")]
    Schema { reason: String },

    #[error("Failed to compute info hash: {reason}")]
    Hash { reason: String },

    #[error("Torrent {info_hash} already added")]
    DuplicateTorrent { info_hash: InfoHash },

    #[error("Tracker announce failed: {reason}")]
    Announce { reason: String },

    #[error("Failed to connect to {address}: {reason}")]
    Dial { address: SocketAddr, reason: String },

    #[error("Handshake with {address} failed: {reason}")]
    Handshake { address: SocketAddr, reason: String },

    #[error("Protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    #[error("Peer closed the connection")]
    Disconnected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}
