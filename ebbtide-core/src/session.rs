//! Session management: the torrent registry, client identity and
//! persistence between runs

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::EbbtideConfig;
use crate::torrent::{
    InfoHash, Metainfo, PeerId, Torrent, TorrentError, TorrentSnapshot, TorrentStatus,
};

/// Client identity attached to every torrent: the generated peer id plus
/// the port advertised to trackers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub peer_id: PeerId,
    pub port: u16,
}

/// Session-level failures.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to persist session: {reason}")]
    Persist { reason: String },

    #[error("{0}")]
    Torrent(#[from] TorrentError),
}

/// The set of torrents managed by one client instance.
///
/// The identity is generated once per session and survives restarts via
/// the snapshot file, so trackers keep seeing the same peer id.
pub struct Session {
    identity: ClientIdentity,
    torrents: RwLock<HashMap<InfoHash, Arc<Torrent>>>,
    config: EbbtideConfig,
}

impl Session {
    /// Creates a fresh session with a newly generated peer id.
    pub fn new(config: EbbtideConfig) -> Self {
        let identity = ClientIdentity {
            peer_id: PeerId::generate(config.session.client_tag),
            port: config.session.listen_port,
        };
        tracing::info!(
            "new session, peer id {} on port {}",
            identity.peer_id,
            identity.port
        );
        Self {
            identity,
            torrents: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id
    }

    pub fn port(&self) -> u16 {
        self.identity.port
    }

    /// Registers a torrent under its info hash.
    ///
    /// # Errors
    ///
    /// - `TorrentError::DuplicateTorrent` - Info hash already managed;
    ///   the session is left unchanged
    pub async fn add_torrent(&self, metainfo: Metainfo) -> Result<Arc<Torrent>, TorrentError> {
        let mut torrents = self.torrents.write().await;
        if torrents.contains_key(&metainfo.info_hash) {
            return Err(TorrentError::DuplicateTorrent {
                info_hash: metainfo.info_hash,
            });
        }
        let torrent = Arc::new(Torrent::new(metainfo, self.identity, &self.config));
        torrents.insert(torrent.info_hash(), Arc::clone(&torrent));
        tracing::info!("added torrent {} ({})", torrent.name(), torrent.info_hash());
        Ok(torrent)
    }

    /// Returns the managed torrent with this info hash, if any.
    pub async fn torrent(&self, info_hash: InfoHash) -> Option<Arc<Torrent>> {
        self.torrents.read().await.get(&info_hash).cloned()
    }

    /// All managed torrents, in no particular order.
    pub async fn torrents(&self) -> Vec<Arc<Torrent>> {
        self.torrents.read().await.values().cloned().collect()
    }

    /// Saves a session snapshot to the configured path.
    ///
    /// # Errors
    ///
    /// - `SessionError::Persist` - Serialization or write failure
    pub async fn save(&self) -> Result<(), SessionError> {
        let path = &self.config.session.snapshot_path;
        let snapshot = self.snapshot().await;
        let encoded =
            serde_json::to_string_pretty(&snapshot).map_err(|e| SessionError::Persist {
                reason: format!("serialization failed: {e}"),
            })?;
        tokio::fs::write(path, encoded)
            .await
            .map_err(|e| SessionError::Persist {
                reason: format!("write to {} failed: {e}", path.display()),
            })?;
        tracing::debug!("session saved to {}", path.display());
        Ok(())
    }

    /// Restores the previous session from the configured snapshot path.
    ///
    /// A missing or unusable snapshot falls back to a fresh session
    /// rather than failing. Torrents that were running when the snapshot
    /// was taken are started again.
    pub async fn load(config: EbbtideConfig) -> Self {
        let path = config.session.snapshot_path.clone();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no previous session at {}, starting fresh", path.display());
                return Self::new(config);
            }
            Err(error) => {
                tracing::warn!(
                    "could not read session from {}: {error}, starting fresh",
                    path.display()
                );
                return Self::new(config);
            }
        };

        let session = match serde_json::from_slice::<SessionSnapshot>(&bytes) {
            Ok(snapshot) => Self::from_snapshot(snapshot, config),
            Err(error) => {
                tracing::warn!(
                    "could not parse session file {}: {error}, starting fresh",
                    path.display()
                );
                return Self::new(config);
            }
        };

        let total = session.torrents.read().await.len();
        let resumed = session.resume().await;
        tracing::info!(
            "restored {total} torrents from {}, {resumed} resumed",
            path.display()
        );
        session
    }

    /// Starts every restored torrent that was running when the snapshot
    /// was taken. Returns how many were started.
    async fn resume(&self) -> usize {
        let mut resumed = 0;
        for torrent in self.torrents.read().await.values() {
            if torrent.status() == TorrentStatus::Started {
                Arc::clone(torrent).start();
                resumed += 1;
            }
        }
        resumed
    }

    /// Logs a status report for the whole session.
    pub async fn debug(&self) {
        let mut torrents = self.torrents().await;
        torrents.sort_by(|a, b| a.name().cmp(b.name()));
        tracing::info!(
            "session {} on port {}: {} torrents",
            self.identity.peer_id,
            self.identity.port,
            torrents.len()
        );
        for torrent in torrents {
            torrent.debug().await;
        }
    }

    /// Stops every torrent's tasks and waits for them to finish.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down session");
        for torrent in self.torrents().await {
            torrent.shutdown().await;
        }
    }

    /// Serializable snapshot of the whole session.
    pub async fn snapshot(&self) -> SessionSnapshot {
        let torrents = self.torrents.read().await;
        let mut entries = Vec::with_capacity(torrents.len());
        for torrent in torrents.values() {
            entries.push(torrent.snapshot().await);
        }
        // Stable order keeps the snapshot file diffable between runs.
        entries.sort_by_key(|torrent| torrent.metainfo.info_hash);
        SessionSnapshot {
            peer_id: self.identity.peer_id,
            port: self.identity.port,
            torrents: entries,
        }
    }

    fn from_snapshot(snapshot: SessionSnapshot, config: EbbtideConfig) -> Self {
        let identity = ClientIdentity {
            peer_id: snapshot.peer_id,
            port: snapshot.port,
        };
        let torrents = snapshot
            .torrents
            .into_iter()
            .map(|entry| {
                let torrent = Arc::new(Torrent::from_snapshot(entry, identity, &config));
                (torrent.info_hash(), torrent)
            })
            .collect();
        Self {
            identity,
            torrents: RwLock::new(torrents),
            config,
        }
    }
}

/// Serialized session state written to the snapshot file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub peer_id: PeerId,
    pub port: u16,
    pub torrents: Vec<TorrentSnapshot>,
}
