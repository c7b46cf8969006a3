//! Per-torrent orchestration: tracker tasks, connection workers, swarm state

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::dispatch::PeerDispatch;
use super::metainfo::Metainfo;
use super::peer::{Peer, PeerContext, PeerSnapshot, PeerStatus};
use super::tracker::{AnnounceRequest, Tracker, TrackerSnapshot};
use super::{InfoHash, TorrentStatus};
use crate::config::EbbtideConfig;
use crate::session::ClientIdentity;

/// Transfer state of a single piece.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PieceFlag {
    #[default]
    None,
    Requested,
    Completed,
}

/// Per-piece bookkeeping: transfer flag plus swarm availability count.
///
/// Kept for the request scheduler; nothing updates availability yet since
/// inbound messages are classified but not acted on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceState {
    pub flag: PieceFlag,
    pub availability: u8,
}

/// A torrent under management and the tasks driving it.
///
/// Construction is inert. `start` spawns one announce task per tracker
/// and a fixed pool of connection workers, all tied to this torrent's
/// shutdown channel.
pub struct Torrent {
    metainfo: Metainfo,
    location: PathBuf,
    identity: ClientIdentity,
    config: EbbtideConfig,
    status: RwLock<TorrentStatus>,
    downloaded: AtomicU64,
    uploaded: AtomicU64,
    left: AtomicU64,
    bitmap: RwLock<Vec<PieceState>>,
    trackers: Vec<Arc<Tracker>>,
    peers: tokio::sync::RwLock<Vec<Arc<Peer>>>,
    dispatch: PeerDispatch,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Torrent {
    /// Creates a stopped torrent from its metainfo.
    pub fn new(metainfo: Metainfo, identity: ClientIdentity, config: &EbbtideConfig) -> Self {
        let trackers = metainfo
            .announce_list
            .iter()
            .map(|url| Arc::new(Tracker::new(url.clone(), config)))
            .collect();
        let bitmap = vec![PieceState::default(); metainfo.piece_count()];
        let left = metainfo.total_length();
        let location = config.session.download_dir.join(&metainfo.name);
        let (shutdown, _) = watch::channel(false);

        Self {
            metainfo,
            location,
            identity,
            config: config.clone(),
            status: RwLock::new(TorrentStatus::Stopped),
            downloaded: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
            left: AtomicU64::new(left),
            bitmap: RwLock::new(bitmap),
            trackers,
            peers: tokio::sync::RwLock::new(Vec::new()),
            dispatch: PeerDispatch::new(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn info_hash(&self) -> InfoHash {
        self.metainfo.info_hash
    }

    pub fn name(&self) -> &str {
        &self.metainfo.name
    }

    pub fn status(&self) -> TorrentStatus {
        *self.status.read()
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn left(&self) -> u64 {
        self.left.load(Ordering::Relaxed)
    }

    pub fn trackers(&self) -> &[Arc<Tracker>] {
        &self.trackers
    }

    /// Spawns the tracker and connection-worker tasks. Idempotent: a
    /// torrent whose tasks are already running is left alone.
    pub fn start(self: Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        *self.status.write() = TorrentStatus::Started;
        tracing::info!(
            "starting torrent {} ({})",
            self.metainfo.name,
            self.metainfo.info_hash
        );

        for tracker in &self.trackers {
            let tracker = Arc::clone(tracker);
            let torrent = Arc::clone(&self);
            let shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(tracker.run(torrent, shutdown)));
        }
        for worker in 0..self.config.torrent.dispatch_workers {
            let torrent = Arc::clone(&self);
            tasks.push(tokio::spawn(async move {
                torrent.run_worker(worker).await;
            }));
        }
    }

    /// Connection worker: pulls queued peers and drives their wire
    /// sessions until shutdown or queue close.
    async fn run_worker(&self, index: usize) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            let peer = tokio::select! {
                _ = shutdown.changed() => break,
                peer = self.dispatch.next() => match peer {
                    Some(peer) => peer,
                    None => break,
                },
            };
            // Each peer is queued once, so a lost claim race is unexpected
            // but harmless.
            let Some(_claim) = peer.claim() else { continue };
            let ctx = PeerContext {
                info_hash: self.metainfo.info_hash,
                peer_id: self.identity.peer_id,
                network: self.config.network.clone(),
                shutdown: shutdown.clone(),
            };
            peer.run_connection(ctx).await;
        }
        tracing::debug!("connection worker {index} for {} stopped", self.metainfo.name);
    }

    /// Registers a discovered peer and queues it for connection.
    ///
    /// Addresses already in the swarm are dropped, whatever their state.
    /// Returns whether the peer was added.
    pub async fn add_peer(&self, address: SocketAddr) -> bool {
        let mut peers = self.peers.write().await;
        if peers.iter().any(|peer| peer.address() == address) {
            return false;
        }
        let peer = Arc::new(Peer::new(address));
        peers.push(Arc::clone(&peer));
        drop(peers);

        if !self.dispatch.push(peer) {
            tracing::debug!("dispatch queue closed, not connecting {address}");
        }
        true
    }

    /// First peer that is neither claimed by a worker nor errored.
    pub async fn available_peer(&self) -> Option<Arc<Peer>> {
        self.peers
            .read()
            .await
            .iter()
            .find(|peer| !peer.is_claimed() && peer.status() != PeerStatus::Error)
            .cloned()
    }

    /// Number of peers currently claimed by a connection worker.
    pub async fn connected_peers(&self) -> usize {
        self.peers
            .read()
            .await
            .iter()
            .filter(|peer| peer.is_claimed())
            .count()
    }

    /// Builds the announce request from the current transfer counters.
    pub(crate) fn announce_request(&self, tracker_id: Option<Vec<u8>>) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: self.metainfo.info_hash,
            peer_id: self.identity.peer_id,
            port: self.identity.port,
            uploaded: self.uploaded.load(Ordering::Relaxed),
            downloaded: self.downloaded.load(Ordering::Relaxed),
            left: self.left.load(Ordering::Relaxed),
            tracker_id,
        }
    }

    /// Logs a progress report: totals, then trackers, then peers with
    /// errored ones first.
    pub async fn debug(&self) {
        let total = self.metainfo.total_length();
        let left = self.left.load(Ordering::Relaxed);
        let done = total.saturating_sub(left);
        let percent = if total == 0 {
            100.0
        } else {
            done as f64 / total as f64 * 100.0
        };
        tracing::info!(
            "torrent {} [{}]: {percent:.1}% ({done}/{total} bytes) -> {}",
            self.metainfo.name,
            self.status(),
            self.location.display()
        );

        for tracker in &self.trackers {
            match tracker.last_error() {
                Some(reason) => {
                    tracing::info!("  tracker {} [{}]: {reason}", tracker.url(), tracker.status());
                }
                None => tracing::info!("  tracker {} [{}]", tracker.url(), tracker.status()),
            }
        }

        let mut peers: Vec<PeerSnapshot> = {
            self.peers.read().await.iter().map(|peer| peer.snapshot()).collect()
        };
        let connected = self.connected_peers().await;
        tracing::info!("  {} peers known, {connected} connected", peers.len());
        peers.sort_by(|a, b| {
            b.status
                .cmp(&a.status)
                .then_with(|| a.address.cmp(&b.address))
        });
        for peer in peers {
            match peer.error_reason {
                Some(reason) => {
                    tracing::info!("  peer {} [{}]: {reason}", peer.address, peer.status);
                }
                None => tracing::info!("  peer {} [{}]", peer.address, peer.status),
            }
        }
    }

    /// Stops every task belonging to this torrent and waits for them.
    ///
    /// The status is left untouched so a snapshot taken afterwards still
    /// resumes the torrent on the next run.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.dispatch.close();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Serializable snapshot of the full swarm state.
    pub async fn snapshot(&self) -> TorrentSnapshot {
        let bitmap = self.bitmap.read().clone();
        let peers = self.peers.read().await.iter().map(|peer| peer.snapshot()).collect();
        TorrentSnapshot {
            metainfo: self.metainfo.clone(),
            location: self.location.clone(),
            status: self.status(),
            downloaded: self.downloaded.load(Ordering::Relaxed),
            uploaded: self.uploaded.load(Ordering::Relaxed),
            left: self.left.load(Ordering::Relaxed),
            bitmap,
            trackers: self.trackers.iter().map(|tracker| tracker.snapshot()).collect(),
            peers,
        }
    }

    /// Rebuilds a torrent from its snapshot, re-attaching the identity and
    /// configuration the snapshot deliberately does not carry.
    ///
    /// Restored peers are not re-queued for connection; new announces
    /// refresh the swarm once the torrent is started.
    pub fn from_snapshot(
        snapshot: TorrentSnapshot,
        identity: ClientIdentity,
        config: &EbbtideConfig,
    ) -> Self {
        let trackers = snapshot
            .trackers
            .into_iter()
            .map(|tracker| Arc::new(Tracker::from_snapshot(tracker, config)))
            .collect();
        let peers = snapshot
            .peers
            .into_iter()
            .map(|peer| Arc::new(Peer::from_snapshot(peer)))
            .collect();
        let (shutdown, _) = watch::channel(false);

        Self {
            metainfo: snapshot.metainfo,
            location: snapshot.location,
            identity,
            config: config.clone(),
            status: RwLock::new(snapshot.status),
            downloaded: AtomicU64::new(snapshot.downloaded),
            uploaded: AtomicU64::new(snapshot.uploaded),
            left: AtomicU64::new(snapshot.left),
            bitmap: RwLock::new(snapshot.bitmap),
            trackers,
            peers: tokio::sync::RwLock::new(peers),
            dispatch: PeerDispatch::new(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }
}

impl std::fmt::Debug for Torrent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Torrent")
            .field("name", &self.metainfo.name)
            .field("info_hash", &self.metainfo.info_hash)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Serialized torrent state stored inside a session snapshot.
///
/// Identity and configuration are attached again on restore instead of
/// being persisted here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorrentSnapshot {
    pub metainfo: Metainfo,
    pub location: PathBuf,
    pub status: TorrentStatus,
    pub downloaded: u64,
    pub uploaded: u64,
    pub left: u64,
    pub bitmap: Vec<PieceState>,
    pub trackers: Vec<TrackerSnapshot>,
    pub peers: Vec<PeerSnapshot>,
}
