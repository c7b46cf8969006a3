//! Tracker announce state machine and peer discovery
//!
//! Each tracker runs as its own task: announce once while `NotConnected`,
//! hand discovered peers to the torrent, then sleep for the advertised
//! interval. `Connected` and `Error` are both terminal for announcing;
//! an errored tracker is parked rather than retried.

pub mod client;

pub use client::{AnnounceClient, AnnounceRequest, AnnounceResponse, HttpAnnounceClient};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use url::Url;

use super::engine::Torrent;
use crate::config::EbbtideConfig;

/// Announce transport, classified from the URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackerProtocol {
    Http,
    Udp,
}

/// Lifecycle of a tracker's announce loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackerStatus {
    /// No successful announce yet; the loop will try again.
    #[default]
    NotConnected,
    /// At least one announce succeeded.
    Connected,
    /// An announce failed or the transport is unsupported.
    Error,
}

impl fmt::Display for TrackerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "not connected"),
            Self::Connected => write!(f, "connected"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    status: TrackerStatus,
    last_error: Option<String>,
    tracker_id: Option<Vec<u8>>,
    /// Announce interval in seconds, as sent by the tracker. Zero until
    /// the first successful announce.
    interval: i64,
}

impl TrackerState {
    /// State for a tracker that can never announce.
    fn errored(reason: String) -> Self {
        Self {
            status: TrackerStatus::Error,
            last_error: Some(reason),
            ..Self::default()
        }
    }
}

/// One announce endpoint of a torrent.
pub struct Tracker {
    url: String,
    protocol: Option<TrackerProtocol>,
    client: Option<Arc<dyn AnnounceClient>>,
    state: Mutex<TrackerState>,
    fallback_interval: Duration,
}

impl Tracker {
    /// Classifies the URL and prepares the transport.
    ///
    /// UDP and unrecognized schemes yield a tracker that starts in `Error`
    /// state. The torrent keeps it for reporting but it never announces.
    pub fn new(url: String, config: &EbbtideConfig) -> Self {
        let (protocol, client, state) = match Url::parse(&url) {
            Ok(parsed) => match parsed.scheme() {
                "http" | "https" => {
                    let client: Arc<dyn AnnounceClient> =
                        Arc::new(HttpAnnounceClient::new(url.clone(), &config.network));
                    (
                        Some(TrackerProtocol::Http),
                        Some(client),
                        TrackerState::default(),
                    )
                }
                "udp" => (
                    Some(TrackerProtocol::Udp),
                    None,
                    TrackerState::errored("UDP trackers are not supported".to_string()),
                ),
                other => (
                    None,
                    None,
                    TrackerState::errored(format!("Protocol not supported: {other}")),
                ),
            },
            Err(error) => (
                None,
                None,
                TrackerState::errored(format!("Invalid tracker URL: {error}")),
            ),
        };

        Self {
            url,
            protocol,
            client,
            state: Mutex::new(state),
            fallback_interval: config.torrent.announce_fallback_interval,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn protocol(&self) -> Option<TrackerProtocol> {
        self.protocol
    }

    pub fn status(&self) -> TrackerStatus {
        self.state.lock().status
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    /// Interval in seconds from the last successful announce, zero before
    /// that.
    pub fn interval(&self) -> i64 {
        self.state.lock().interval
    }

    fn tracker_id(&self) -> Option<Vec<u8>> {
        self.state.lock().tracker_id.clone()
    }

    /// Time to sleep before re-evaluating the loop.
    ///
    /// Trackers that have not supplied a positive interval get the
    /// configured fallback.
    fn sleep_interval(&self) -> Duration {
        let interval = self.state.lock().interval;
        if interval <= 0 {
            self.fallback_interval
        } else {
            Duration::from_secs(interval as u64)
        }
    }

    /// Announce loop, one task per tracker. Runs until shutdown.
    ///
    /// Only a `NotConnected` tracker with a transport dials out; the
    /// other states just re-sleep. A failed tracker therefore stays
    /// parked in `Error` until the engine is restarted.
    pub(crate) async fn run(
        self: Arc<Self>,
        torrent: Arc<Torrent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            if self.status() == TrackerStatus::NotConnected
                && let Some(client) = &self.client
            {
                self.announce_once(client.as_ref(), &torrent).await;
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                () = tokio::time::sleep(self.sleep_interval()) => {}
            }
        }

        tracing::debug!("tracker task for {} stopped", self.url);
    }

    async fn announce_once(&self, client: &dyn AnnounceClient, torrent: &Torrent) {
        let request = torrent.announce_request(self.tracker_id());
        match client.announce(&request).await {
            Ok(response) => {
                tracing::info!(
                    "tracker {} returned {} peers, interval {}s",
                    self.url,
                    response.peers.len(),
                    response.interval
                );
                self.record_success(&response);
                for address in response.peers {
                    torrent.add_peer(address).await;
                }
            }
            Err(error) => {
                tracing::warn!("announce to {} failed: {error}", self.url);
                self.record_failure(error.to_string());
            }
        }
    }

    fn record_success(&self, response: &AnnounceResponse) {
        let mut state = self.state.lock();
        state.status = TrackerStatus::Connected;
        state.last_error = None;
        state.interval = response.interval;
        if let Some(id) = &response.tracker_id {
            state.tracker_id = Some(id.clone());
        }
    }

    fn record_failure(&self, reason: String) {
        let mut state = self.state.lock();
        state.status = TrackerStatus::Error;
        state.last_error = Some(reason);
    }

    /// Serializable view of the tracker for session persistence.
    pub fn snapshot(&self) -> TrackerSnapshot {
        let state = self.state.lock();
        TrackerSnapshot {
            url: self.url.clone(),
            protocol: self.protocol,
            status: state.status,
            last_error: state.last_error.clone(),
            tracker_id: state.tracker_id.clone(),
            interval: state.interval,
        }
    }

    /// Rebuilds a tracker from its snapshot.
    ///
    /// The transport is reconstructed from the URL; status, interval and
    /// continuation token carry over, so a tracker restored as
    /// `Connected` or `Error` does not announce again.
    pub fn from_snapshot(snapshot: TrackerSnapshot, config: &EbbtideConfig) -> Self {
        let tracker = Self::new(snapshot.url, config);
        {
            let mut state = tracker.state.lock();
            state.status = snapshot.status;
            state.last_error = snapshot.last_error;
            state.tracker_id = snapshot.tracker_id;
            state.interval = snapshot.interval;
        }
        tracker
    }
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracker")
            .field("url", &self.url)
            .field("protocol", &self.protocol)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Serialized tracker state stored inside a torrent snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerSnapshot {
    pub url: String,
    pub protocol: Option<TrackerProtocol>,
    pub status: TrackerStatus,
    pub last_error: Option<String>,
    pub tracker_id: Option<Vec<u8>>,
    pub interval: i64,
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::session::ClientIdentity;
    use crate::torrent::{Metainfo, PeerId, TorrentError};

    fn test_config() -> EbbtideConfig {
        EbbtideConfig::default()
    }

    fn test_torrent(config: &EbbtideConfig) -> Torrent {
        let descriptor = format!(
            "d8:announce25:http://t.example/announce4:infod6:lengthi1024e4:name8:test.bin\
             12:piece lengthi512e6:pieces40:{}ee",
            "a".repeat(40)
        );
        let metainfo = Metainfo::from_bytes(descriptor.as_bytes()).unwrap();
        let identity = ClientIdentity {
            peer_id: PeerId::new(*b"-EB0001-aaaabbbbcccc"),
            port: 6881,
        };
        Torrent::new(metainfo, identity, config)
    }

    struct FixedResponseClient {
        response: AnnounceResponse,
    }

    #[async_trait]
    impl AnnounceClient for FixedResponseClient {
        async fn announce(
            &self,
            _request: &AnnounceRequest,
        ) -> Result<AnnounceResponse, TorrentError> {
            Ok(self.response.clone())
        }
    }

    struct FailingClient;

    #[async_trait]
    impl AnnounceClient for FailingClient {
        async fn announce(
            &self,
            _request: &AnnounceRequest,
        ) -> Result<AnnounceResponse, TorrentError> {
            Err(TorrentError::Announce {
                reason: "tracker returned status 503".to_string(),
            })
        }
    }

    #[test]
    fn test_http_scheme_is_supported() {
        let tracker = Tracker::new("http://t.example/announce".to_string(), &test_config());
        assert_eq!(tracker.protocol(), Some(TrackerProtocol::Http));
        assert_eq!(tracker.status(), TrackerStatus::NotConnected);
        assert!(tracker.last_error().is_none());

        let tracker = Tracker::new("https://t.example/announce".to_string(), &test_config());
        assert_eq!(tracker.protocol(), Some(TrackerProtocol::Http));
    }

    #[test]
    fn test_udp_scheme_is_parked() {
        let tracker = Tracker::new("udp://t.example:6969".to_string(), &test_config());
        assert_eq!(tracker.protocol(), Some(TrackerProtocol::Udp));
        assert_eq!(tracker.status(), TrackerStatus::Error);
        assert_eq!(
            tracker.last_error().as_deref(),
            Some("UDP trackers are not supported")
        );
    }

    #[test]
    fn test_unknown_scheme_is_parked() {
        let tracker = Tracker::new("wss://t.example/announce".to_string(), &test_config());
        assert_eq!(tracker.protocol(), None);
        assert_eq!(tracker.status(), TrackerStatus::Error);
        assert_eq!(
            tracker.last_error().as_deref(),
            Some("Protocol not supported: wss")
        );
    }

    #[test]
    fn test_invalid_url_is_parked() {
        let tracker = Tracker::new("not a url".to_string(), &test_config());
        assert_eq!(tracker.protocol(), None);
        assert_eq!(tracker.status(), TrackerStatus::Error);
        assert!(tracker.last_error().is_some());
    }

    #[test]
    fn test_sleep_interval_fallback() {
        let tracker = Tracker::new("http://t.example/announce".to_string(), &test_config());
        assert_eq!(tracker.sleep_interval(), Duration::from_secs(10));

        tracker.record_success(&AnnounceResponse {
            interval: 900,
            tracker_id: None,
            peers: Vec::new(),
        });
        assert_eq!(tracker.sleep_interval(), Duration::from_secs(900));

        tracker.record_success(&AnnounceResponse {
            interval: 0,
            tracker_id: None,
            peers: Vec::new(),
        });
        assert_eq!(
            tracker.sleep_interval(),
            Duration::from_secs(10),
            "non-positive interval falls back"
        );
    }

    #[test]
    fn test_record_success_keeps_previous_tracker_id() {
        let tracker = Tracker::new("http://t.example/announce".to_string(), &test_config());
        tracker.record_success(&AnnounceResponse {
            interval: 60,
            tracker_id: Some(b"abc".to_vec()),
            peers: Vec::new(),
        });
        tracker.record_success(&AnnounceResponse {
            interval: 60,
            tracker_id: None,
            peers: Vec::new(),
        });
        assert_eq!(tracker.tracker_id(), Some(b"abc".to_vec()));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let tracker = Tracker::new("http://t.example/announce".to_string(), &test_config());
        tracker.record_success(&AnnounceResponse {
            interval: 1800,
            tracker_id: Some(b"tid".to_vec()),
            peers: Vec::new(),
        });

        let snapshot = tracker.snapshot();
        let restored = Tracker::from_snapshot(snapshot.clone(), &test_config());

        assert_eq!(restored.url(), tracker.url());
        assert_eq!(restored.protocol(), Some(TrackerProtocol::Http));
        assert_eq!(restored.status(), TrackerStatus::Connected);
        assert_eq!(restored.interval(), 1800);
        assert_eq!(restored.tracker_id(), Some(b"tid".to_vec()));
        assert_eq!(restored.snapshot(), snapshot);
    }

    #[test]
    fn test_failure_is_sticky() {
        let tracker = Tracker::new("http://t.example/announce".to_string(), &test_config());
        tracker.record_failure("tracker returned status 503".to_string());
        assert_eq!(tracker.status(), TrackerStatus::Error);
        assert_eq!(
            tracker.last_error().as_deref(),
            Some("tracker returned status 503")
        );
    }

    #[tokio::test]
    async fn test_announce_hands_peers_to_torrent() {
        let config = EbbtideConfig::for_testing();
        let torrent = test_torrent(&config);
        let tracker = Tracker::new("http://t.example/announce".to_string(), &config);
        let client = FixedResponseClient {
            response: AnnounceResponse {
                interval: 900,
                tracker_id: None,
                peers: vec![
                    "10.0.0.1:6881".parse().unwrap(),
                    "10.0.0.2:6882".parse().unwrap(),
                ],
            },
        };

        tracker.announce_once(&client, &torrent).await;

        assert_eq!(tracker.status(), TrackerStatus::Connected);
        assert_eq!(tracker.interval(), 900);
        let peers = torrent.snapshot().await.peers;
        assert_eq!(peers.len(), 2);
        assert!(peers.iter().all(|peer| peer.choked && !peer.interested));
    }

    #[tokio::test]
    async fn test_failed_announce_parks_tracker() {
        let config = EbbtideConfig::for_testing();
        let torrent = test_torrent(&config);
        let tracker = Tracker::new("http://t.example/announce".to_string(), &config);

        tracker.announce_once(&FailingClient, &torrent).await;

        assert_eq!(tracker.status(), TrackerStatus::Error);
        assert_eq!(
            tracker.last_error().as_deref(),
            Some("Tracker announce failed: tracker returned status 503")
        );
        assert!(torrent.snapshot().await.peers.is_empty());
    }
}
