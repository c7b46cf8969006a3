//! Centralized configuration for Ebbtide.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::path::PathBuf;
use std::time::Duration;

/// Central configuration for all Ebbtide components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct EbbtideConfig {
    pub torrent: TorrentConfig,
    pub network: NetworkConfig,
    pub session: SessionConfig,
}

/// Torrent engine configuration.
///
/// Controls the connection worker pool and announce retry behavior.
#[derive(Debug, Clone)]
pub struct TorrentConfig {
    /// Connection workers driving peer sessions per torrent
    pub dispatch_workers: usize,
    /// Sleep between announce attempts when the tracker gave no interval
    pub announce_fallback_interval: Duration,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            dispatch_workers: 10,
            announce_fallback_interval: Duration::from_secs(10),
        }
    }
}

/// Peer and tracker network configuration.
///
/// Controls connection timeouts, wire protocol deadlines, and tracker
/// communication parameters.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// TCP connect timeout when dialing a peer
    pub peer_dial_timeout: Duration,
    /// Deadline for the remote handshake to arrive
    pub handshake_timeout: Duration,
    /// Read deadline for each wire frame; an idle expiry is not an error
    pub peer_read_timeout: Duration,
    /// Reject peers whose handshake carries a different info hash
    pub validate_handshake_info_hash: bool,
    /// HTTP request timeout for tracker communication
    pub tracker_timeout: Duration,
    /// User agent for HTTP requests
    pub user_agent: &'static str,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            peer_dial_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            peer_read_timeout: Duration::from_secs(2),
            validate_handshake_info_hash: true,
            tracker_timeout: Duration::from_secs(30),
            user_agent: "ebbtide/0.1.0",
        }
    }
}

/// Session identity and persistence configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// TCP port advertised to trackers for inbound connections
    pub listen_port: u16,
    /// Client tag prefixed to generated peer ids
    pub client_tag: &'static str,
    /// Where the session snapshot is saved between runs
    pub snapshot_path: PathBuf,
    /// Directory completed downloads are placed under
    pub download_dir: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            listen_port: 6881,
            client_tag: "-EB0001-",
            snapshot_path: PathBuf::from("session.json"),
            download_dir: PathBuf::from("downloads"),
        }
    }
}

impl EbbtideConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // Network configuration overrides
        if let Ok(timeout) = std::env::var("EBBTIDE_TRACKER_TIMEOUT") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.network.tracker_timeout = Duration::from_secs(seconds);
            }
        }

        if let Ok(timeout) = std::env::var("EBBTIDE_PEER_READ_TIMEOUT") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.network.peer_read_timeout = Duration::from_secs(seconds);
            }
        }

        if let Ok(validate) = std::env::var("EBBTIDE_VALIDATE_INFO_HASH") {
            config.network.validate_handshake_info_hash = validate.parse().unwrap_or(true);
        }

        // Torrent configuration overrides
        if let Ok(workers) = std::env::var("EBBTIDE_DISPATCH_WORKERS") {
            if let Ok(count) = workers.parse::<usize>() {
                config.torrent.dispatch_workers = count;
            }
        }

        // Session configuration overrides
        if let Ok(port) = std::env::var("EBBTIDE_LISTEN_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                config.session.listen_port = port;
            }
        }

        if let Ok(path) = std::env::var("EBBTIDE_SNAPSHOT_PATH") {
            config.session.snapshot_path = PathBuf::from(path);
        }

        if let Ok(dir) = std::env::var("EBBTIDE_DOWNLOAD_DIR") {
            config.session.download_dir = PathBuf::from(dir);
        }

        config
    }

    /// Creates a configuration optimized for testing.
    pub fn for_testing() -> Self {
        Self {
            torrent: TorrentConfig {
                dispatch_workers: 2,
                announce_fallback_interval: Duration::from_millis(100),
            },
            network: NetworkConfig {
                peer_dial_timeout: Duration::from_millis(500),
                handshake_timeout: Duration::from_millis(500),
                peer_read_timeout: Duration::from_millis(200),
                tracker_timeout: Duration::from_secs(2),
                ..Default::default()
            },
            session: SessionConfig::default(),
        }
    }
}
