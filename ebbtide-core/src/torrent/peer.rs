//! Peer connection state and the TCP wire engine

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;

use super::protocol::{
    Frame, HANDSHAKE_LENGTH, Handshake, MessageId, PeerId, validate_frame_length,
};
use super::{InfoHash, TorrentError};
use crate::config::NetworkConfig;

/// Connection lifecycle of a remote peer.
///
/// `Disconnected` covers both never-connected and cleanly-closed; a clean
/// close is not a failure. `Connected` is entered only once the handshake
/// round trip succeeds, so a dialed-but-unanswered peer still reads as
/// `Disconnected`. Errored peers are never redispatched.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum PeerStatus {
    #[default]
    Disconnected,
    Connected,
    Error,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerStatus::Disconnected => write!(f, "disconnected"),
            PeerStatus::Connected => write!(f, "connected"),
            PeerStatus::Error => write!(f, "error"),
        }
    }
}

/// Mutable connection state, written by the engine as a connection runs.
#[derive(Debug)]
struct PeerState {
    status: PeerStatus,
    error_reason: Option<String>,
    remote_id: Option<PeerId>,
    choked: bool,
    interested: bool,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            status: PeerStatus::Disconnected,
            error_reason: None,
            remote_id: None,
            choked: true,
            interested: false,
        }
    }
}

/// A remote peer: fixed address, learned wire state and the claim flag.
///
/// The claim flag gives one worker exclusive ownership of the connection
/// attempt; it is a runtime concern and never persisted.
pub struct Peer {
    address: SocketAddr,
    state: Mutex<PeerState>,
    claimed: AtomicBool,
}

impl Peer {
    /// Creates an unclaimed peer in its default state (choked, not
    /// interested, disconnected).
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            state: Mutex::new(PeerState::default()),
            claimed: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn status(&self) -> PeerStatus {
        self.state.lock().status
    }

    pub fn error_reason(&self) -> Option<String> {
        self.state.lock().error_reason.clone()
    }

    /// Peer ID the remote sent in its handshake, once one completed.
    pub fn remote_id(&self) -> Option<PeerId> {
        self.state.lock().remote_id
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Claims the peer for exclusive use by one worker.
    ///
    /// Returns `None` if another worker already holds the claim. The
    /// returned guard releases the claim on drop, covering every exit path
    /// of the connection engine.
    pub fn claim(&self) -> Option<ClaimGuard<'_>> {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            .then_some(ClaimGuard { peer: self })
    }

    /// Serializable view of this peer for session persistence.
    pub fn snapshot(&self) -> PeerSnapshot {
        let state = self.state.lock();
        PeerSnapshot {
            address: self.address,
            status: state.status,
            error_reason: state.error_reason.clone(),
            remote_id: state.remote_id,
            choked: state.choked,
            interested: state.interested,
        }
    }

    /// Rebuilds a peer from its persisted state, unclaimed.
    pub fn from_snapshot(snapshot: PeerSnapshot) -> Self {
        Self {
            address: snapshot.address,
            state: Mutex::new(PeerState {
                status: snapshot.status,
                error_reason: snapshot.error_reason,
                remote_id: snapshot.remote_id,
                choked: snapshot.choked,
                interested: snapshot.interested,
            }),
            claimed: AtomicBool::new(false),
        }
    }

    /// Dials the peer, handshakes and reads frames until the connection
    /// ends, recording the outcome on the peer's status.
    pub(crate) async fn run_connection(&self, ctx: PeerContext) {
        let PeerContext {
            info_hash,
            peer_id,
            network,
            mut shutdown,
        } = ctx;

        match self
            .connect_and_read(info_hash, peer_id, &network, &mut shutdown)
            .await
        {
            Ok(()) | Err(TorrentError::Disconnected) => self.mark_disconnected(),
            Err(error) => {
                tracing::debug!("peer {} failed: {error}", self.address);
                self.mark_error(error.to_string());
            }
        }
    }

    async fn connect_and_read(
        &self,
        info_hash: InfoHash,
        peer_id: PeerId,
        network: &NetworkConfig,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), TorrentError> {
        let address = self.address;
        tracing::debug!("connecting to peer {address}");

        let mut stream = match timeout(network.peer_dial_timeout, TcpStream::connect(address)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => {
                return Err(TorrentError::Dial {
                    address,
                    reason: error.to_string(),
                });
            }
            Err(_) => {
                return Err(TorrentError::Dial {
                    address,
                    reason: format!("timed out after {:?}", network.peer_dial_timeout),
                });
            }
        };

        self.exchange_handshake(&mut stream, info_hash, peer_id, network)
            .await?;
        // Connected means the handshake round trip completed, not just TCP.
        self.mark_connected();
        self.read_frames(&mut stream, network, shutdown).await
    }

    async fn exchange_handshake(
        &self,
        stream: &mut TcpStream,
        info_hash: InfoHash,
        peer_id: PeerId,
        network: &NetworkConfig,
    ) -> Result<(), TorrentError> {
        let address = self.address;

        let handshake = Handshake::new(info_hash, peer_id);
        stream
            .write_all(&handshake.encode())
            .await
            .map_err(|error| TorrentError::Handshake {
                address,
                reason: format!("write failed: {error}"),
            })?;

        let mut buf = [0u8; HANDSHAKE_LENGTH];
        match timeout(network.handshake_timeout, stream.read_exact(&mut buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => {
                return Err(TorrentError::Handshake {
                    address,
                    reason: format!("read failed: {error}"),
                });
            }
            Err(_) => {
                return Err(TorrentError::Handshake {
                    address,
                    reason: format!("timed out after {:?}", network.handshake_timeout),
                });
            }
        }

        let remote = Handshake::decode(&buf).map_err(|error| TorrentError::Handshake {
            address,
            reason: error.to_string(),
        })?;

        if network.validate_handshake_info_hash && remote.info_hash != info_hash {
            return Err(TorrentError::Handshake {
                address,
                reason: format!("info hash mismatch: got {}", remote.info_hash),
            });
        }

        self.record_remote_id(remote.peer_id);
        tracing::debug!("handshake with {address} complete, remote id {}", remote.peer_id);
        Ok(())
    }

    /// Reads length-prefixed frames until EOF, error or shutdown.
    ///
    /// A timeout on the length prefix just means an idle peer; a timeout
    /// mid-frame is a failure. Payloads are drained in full so framing
    /// stays aligned.
    async fn read_frames(
        &self,
        stream: &mut TcpStream,
        network: &NetworkConfig,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), TorrentError> {
        let address = self.address;
        loop {
            if *shutdown.borrow() {
                tracing::debug!("shutting down connection to {address}");
                return Ok(());
            }

            let mut length_buf = [0u8; 4];
            let read = tokio::select! {
                _ = shutdown.changed() => {
                    tracing::debug!("shutting down connection to {address}");
                    return Ok(());
                }
                read = timeout(network.peer_read_timeout, stream.read_exact(&mut length_buf)) => read,
            };
            match read {
                Ok(Ok(_)) => {}
                Ok(Err(error)) => return Err(classify_read_error(error)),
                // Idle peer; wait for the next frame.
                Err(_) => continue,
            }

            let length = i32::from_be_bytes(length_buf);
            validate_frame_length(length)?;

            if length == 0 {
                tracing::trace!("keep-alive from {address}");
                continue;
            }

            let frame = read_message(stream, network.peer_read_timeout, length as usize).await?;
            tracing::debug!("peer {address}: {frame}");
        }
    }

    fn mark_connected(&self) {
        let mut state = self.state.lock();
        state.status = PeerStatus::Connected;
        state.error_reason = None;
    }

    fn mark_disconnected(&self) {
        self.state.lock().status = PeerStatus::Disconnected;
    }

    pub(crate) fn mark_error(&self, reason: String) {
        let mut state = self.state.lock();
        state.status = PeerStatus::Error;
        state.error_reason = Some(reason);
    }

    fn record_remote_id(&self, id: PeerId) {
        self.state.lock().remote_id = Some(id);
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("address", &self.address)
            .field("status", &self.status())
            .field("claimed", &self.is_claimed())
            .finish()
    }
}

/// Exclusive claim on a peer, released on drop.
pub struct ClaimGuard<'a> {
    peer: &'a Peer,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        self.peer.claimed.store(false, Ordering::Release);
    }
}

/// Serializable view of a peer for session persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub address: SocketAddr,
    pub status: PeerStatus,
    pub error_reason: Option<String>,
    pub remote_id: Option<PeerId>,
    pub choked: bool,
    pub interested: bool,
}

/// Everything one connection needs from the owning torrent and session.
#[derive(Debug, Clone)]
pub(crate) struct PeerContext {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub network: NetworkConfig,
    pub shutdown: watch::Receiver<bool>,
}

/// Reads the id byte and exactly `length - 1` payload bytes of one frame.
async fn read_message(
    stream: &mut TcpStream,
    deadline: Duration,
    length: usize,
) -> Result<Frame, TorrentError> {
    let mut id_buf = [0u8; 1];
    read_frame_bytes(stream, deadline, &mut id_buf).await?;
    let id = MessageId::from_byte(id_buf[0]);

    let mut payload = vec![0u8; length - 1];
    read_frame_bytes(stream, deadline, &mut payload).await?;

    Ok(Frame::Message {
        id,
        payload: Bytes::from(payload),
    })
}

/// Mid-frame read helper; stalls here are failures, not idleness.
async fn read_frame_bytes(
    stream: &mut TcpStream,
    deadline: Duration,
    buf: &mut [u8],
) -> Result<(), TorrentError> {
    match timeout(deadline, stream.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(error)) => Err(classify_read_error(error)),
        Err(_) => Err(TorrentError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "timed out mid-frame",
        ))),
    }
}

/// A closed socket is a clean disconnect; everything else is a failure.
fn classify_read_error(error: std::io::Error) -> TorrentError {
    if error.kind() == std::io::ErrorKind::UnexpectedEof {
        TorrentError::Disconnected
    } else {
        TorrentError::Io(error)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;

    fn test_network() -> NetworkConfig {
        NetworkConfig {
            peer_dial_timeout: Duration::from_millis(500),
            handshake_timeout: Duration::from_millis(500),
            peer_read_timeout: Duration::from_millis(300),
            ..NetworkConfig::default()
        }
    }

    fn test_context(info_hash: InfoHash) -> (PeerContext, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = PeerContext {
            info_hash,
            peer_id: PeerId::new(*b"-EB0001-testtesttest"),
            network: test_network(),
            shutdown: shutdown_rx,
        };
        (ctx, shutdown_tx)
    }

    fn remote_handshake(info_hash: InfoHash) -> [u8; HANDSHAKE_LENGTH] {
        Handshake::new(info_hash, PeerId::new(*b"-XX9999-abcdefghijkl")).encode()
    }

    #[test]
    fn test_claim_is_exclusive() {
        let peer = Peer::new(SocketAddr::from(([127, 0, 0, 1], 6881)));

        let guard = peer.claim().expect("first claim succeeds");
        assert!(peer.is_claimed());
        assert!(peer.claim().is_none(), "second claim must fail");

        drop(guard);
        assert!(!peer.is_claimed());
        assert!(peer.claim().is_some(), "released peer can be reclaimed");
    }

    #[test]
    fn test_snapshot_round_trip() {
        let peer = Peer::new(SocketAddr::from(([10, 1, 2, 3], 51413)));
        peer.mark_error("no route".to_string());

        let snapshot = peer.snapshot();
        let restored = Peer::from_snapshot(snapshot.clone());

        assert_eq!(restored.address(), peer.address());
        assert_eq!(restored.status(), PeerStatus::Error);
        assert_eq!(restored.error_reason().as_deref(), Some("no route"));
        assert!(!restored.is_claimed());
        assert!(snapshot.choked);
        assert!(!snapshot.interested);
    }

    #[tokio::test]
    async fn test_connection_handshake_and_clean_close() {
        let info_hash = InfoHash::new([7u8; 20]);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let mock = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();

            let mut received = [0u8; HANDSHAKE_LENGTH];
            socket.read_exact(&mut received).await.unwrap();
            assert_eq!(received[0], 19);
            assert_eq!(&received[28..48], &[7u8; 20]);

            socket.write_all(&remote_handshake(info_hash)).await.unwrap();

            // Keep-alive, then a choke, then a have frame whose payload
            // arrives late so the engine must block for the full payload.
            socket.write_all(&[0, 0, 0, 0]).await.unwrap();
            socket.write_all(&[0, 0, 0, 1, 0]).await.unwrap();
            socket.write_all(&[0, 0, 0, 5, 4]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            socket.write_all(&[0, 0, 0, 7]).await.unwrap();
        });

        let peer = Peer::new(address);
        let (ctx, _shutdown) = test_context(info_hash);
        peer.run_connection(ctx).await;
        mock.await.unwrap();

        assert_eq!(peer.status(), PeerStatus::Disconnected);
        assert_eq!(
            peer.remote_id(),
            Some(PeerId::new(*b"-XX9999-abcdefghijkl"))
        );
        assert!(peer.error_reason().is_none());
    }

    #[tokio::test]
    async fn test_handshake_failure_sets_error_and_releases_claim() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let mock = tokio::spawn(async move {
            // Accept and close without answering the handshake.
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let peer = Peer::new(address);
        let guard = peer.claim().expect("claim before connecting");
        let (ctx, _shutdown) = test_context(InfoHash::new([7u8; 20]));
        peer.run_connection(ctx).await;
        mock.await.unwrap();
        drop(guard);

        assert_eq!(peer.status(), PeerStatus::Error);
        let reason = peer.error_reason().expect("error reason recorded");
        assert!(reason.contains("Handshake"), "unexpected reason: {reason}");
        assert!(!peer.is_claimed(), "claim must be released");
    }

    #[tokio::test]
    async fn test_status_stays_disconnected_until_handshake_completes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let mock = tokio::spawn(async move {
            // Accept the dial, then never answer the handshake.
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(socket);
        });

        let peer = Arc::new(Peer::new(address));
        let (ctx, _shutdown) = test_context(InfoHash::new([7u8; 20]));

        let runner = {
            let peer = Arc::clone(&peer);
            tokio::spawn(async move { peer.run_connection(ctx).await })
        };

        // The dial has landed but the handshake answer never comes.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            peer.status(),
            PeerStatus::Disconnected,
            "peer must not count as connected before the handshake completes"
        );

        runner.await.unwrap();
        mock.abort();

        assert_eq!(peer.status(), PeerStatus::Error);
        let reason = peer.error_reason().expect("error reason recorded");
        assert!(reason.contains("Handshake"), "unexpected reason: {reason}");
    }

    #[tokio::test]
    async fn test_info_hash_mismatch_rejected_when_validating() {
        let info_hash = InfoHash::new([7u8; 20]);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let mock = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = [0u8; HANDSHAKE_LENGTH];
            socket.read_exact(&mut received).await.unwrap();
            socket
                .write_all(&remote_handshake(InfoHash::new([9u8; 20])))
                .await
                .unwrap();
        });

        let peer = Peer::new(address);
        let (ctx, _shutdown) = test_context(info_hash);
        peer.run_connection(ctx).await;
        mock.await.unwrap();

        assert_eq!(peer.status(), PeerStatus::Error);
        let reason = peer.error_reason().unwrap();
        assert!(reason.contains("info hash mismatch"), "reason: {reason}");
    }

    #[tokio::test]
    async fn test_info_hash_mismatch_tolerated_when_disabled() {
        let info_hash = InfoHash::new([7u8; 20]);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let mock = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = [0u8; HANDSHAKE_LENGTH];
            socket.read_exact(&mut received).await.unwrap();
            socket
                .write_all(&remote_handshake(InfoHash::new([9u8; 20])))
                .await
                .unwrap();
        });

        let peer = Peer::new(address);
        let (mut ctx, _shutdown) = test_context(info_hash);
        ctx.network.validate_handshake_info_hash = false;
        peer.run_connection(ctx).await;
        mock.await.unwrap();

        assert_eq!(peer.status(), PeerStatus::Disconnected);
        assert!(peer.remote_id().is_some());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_protocol_violation() {
        let info_hash = InfoHash::new([7u8; 20]);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let mock = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = [0u8; HANDSHAKE_LENGTH];
            socket.read_exact(&mut received).await.unwrap();
            socket.write_all(&remote_handshake(info_hash)).await.unwrap();
            // 65536 byte frame announcement, over the 32768 limit.
            socket.write_all(&[0, 1, 0, 0]).await.unwrap();
            // Hold the socket open so EOF cannot race the violation.
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let peer = Peer::new(address);
        let (ctx, _shutdown) = test_context(info_hash);
        peer.run_connection(ctx).await;
        mock.await.unwrap();

        assert_eq!(peer.status(), PeerStatus::Error);
        let reason = peer.error_reason().unwrap();
        assert!(reason.contains("exceeds"), "reason: {reason}");
    }

    #[tokio::test]
    async fn test_dial_failure_sets_error() {
        // Nothing listens on discard-range port 1 in the test environment.
        let peer = Peer::new(SocketAddr::from(([127, 0, 0, 1], 1)));
        let (ctx, _shutdown) = test_context(InfoHash::new([7u8; 20]));
        peer.run_connection(ctx).await;

        assert_eq!(peer.status(), PeerStatus::Error);
        assert!(peer.error_reason().is_some());
    }

    #[tokio::test]
    async fn test_shutdown_ends_read_loop_cleanly() {
        let info_hash = InfoHash::new([7u8; 20]);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let mock = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = [0u8; HANDSHAKE_LENGTH];
            socket.read_exact(&mut received).await.unwrap();
            socket.write_all(&remote_handshake(info_hash)).await.unwrap();
            // Stay silent until the engine shuts down.
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let peer = Peer::new(address);
        let (ctx, shutdown) = test_context(info_hash);

        let signal = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = shutdown.send(true);
        });

        peer.run_connection(ctx).await;
        signal.await.unwrap();
        mock.abort();

        assert_eq!(peer.status(), PeerStatus::Disconnected);
        assert!(peer.error_reason().is_none());
    }
}
