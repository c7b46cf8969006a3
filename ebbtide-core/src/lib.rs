//! Ebbtide Core - BitTorrent swarm engine fundamentals
//!
//! This crate provides the building blocks for a BitTorrent client:
//! metainfo parsing, tracker announces, the peer wire protocol, and
//! session management with persistence between runs.

pub mod config;
pub mod session;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::EbbtideConfig;
pub use session::{Session, SessionError};
pub use torrent::{InfoHash, Metainfo, Torrent, TorrentError};

/// Core errors that can bubble up from any Ebbtide subsystem.
#[derive(Debug, thiserror::Error)]
pub enum EbbtideError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EbbtideError>;
