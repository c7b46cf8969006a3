//! HTTP announce client: URL building, request execution, response parsing

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use async_trait::async_trait;
use serde::Deserialize;
use serde_bytes::ByteBuf;

use crate::config::NetworkConfig;
use crate::torrent::{InfoHash, PeerId, TorrentError};

/// Announce request: client statistics and identity for one tracker call.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    /// TCP port the client advertises for inbound peer connections.
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    /// Opaque continuation token, echoed once a tracker issued one.
    pub tracker_id: Option<Vec<u8>>,
}

/// Parsed announce response.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnounceResponse {
    /// Seconds the tracker wants us to wait before the next announce.
    pub interval: i64,
    pub tracker_id: Option<Vec<u8>>,
    pub peers: Vec<SocketAddr>,
}

/// Transport seam for tracker announces.
///
/// HTTP is the only implementation today; a UDP transport would slot in
/// here.
#[async_trait]
pub trait AnnounceClient: Send + Sync {
    /// Performs one announce round trip.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Http` - Transport failure
    /// - `TorrentError::Announce` - Non-success status, undecodable body or
    ///   an explicit failure reason from the tracker
    async fn announce(&self, request: &AnnounceRequest)
    -> Result<AnnounceResponse, TorrentError>;
}

/// Announce client for HTTP(S) trackers.
pub struct HttpAnnounceClient {
    announce_url: String,
    client: reqwest::Client,
}

// Raw serde shape of the bencoded announce response.
#[derive(Debug, Deserialize)]
struct RawAnnounceResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    interval: Option<i64>,
    #[serde(rename = "tracker id")]
    tracker_id: Option<ByteBuf>,
    peers: Option<ByteBuf>,
}

impl HttpAnnounceClient {
    /// Creates a client for one announce URL using the network settings
    /// for timeout and user agent.
    pub fn new(announce_url: String, config: &NetworkConfig) -> Self {
        Self {
            announce_url,
            client: reqwest::Client::builder()
                .timeout(config.tracker_timeout)
                .user_agent(config.user_agent)
                .redirect(reqwest::redirect::Policy::limited(3))
                .build()
                .expect("HTTP client creation should not fail"),
        }
    }

    /// Builds the full announce URL with its query string.
    ///
    /// The 20-byte values are percent-encoded byte-wise by hand; a URL
    /// library would treat them as UTF-8 text and double-encode.
    fn build_announce_url(&self, request: &AnnounceRequest) -> String {
        let mut query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            url_encode_bytes(request.info_hash.as_bytes()),
            url_encode_bytes(request.peer_id.as_bytes()),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
        );
        if let Some(tracker_id) = &request.tracker_id {
            query.push_str("&trackerid=");
            query.push_str(&url_encode_bytes(tracker_id));
        }
        format!("{}?{}", self.announce_url, query)
    }

    fn parse_announce_response(&self, bytes: &[u8]) -> Result<AnnounceResponse, TorrentError> {
        let raw: RawAnnounceResponse =
            serde_bencode::from_bytes(bytes).map_err(|e| TorrentError::Announce {
                reason: format!("undecodable response: {e}"),
            })?;

        if let Some(reason) = raw.failure_reason {
            return Err(TorrentError::Announce { reason });
        }

        Ok(AnnounceResponse {
            interval: raw.interval.unwrap_or(0),
            tracker_id: raw.tracker_id.map(ByteBuf::into_vec),
            peers: raw
                .peers
                .map(|bytes| parse_compact_peers(&bytes))
                .unwrap_or_default(),
        })
    }
}

#[async_trait]
impl AnnounceClient for HttpAnnounceClient {
    async fn announce(
        &self,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TorrentError> {
        let url = self.build_announce_url(request);
        tracing::debug!("announcing to {}", self.announce_url);

        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TorrentError::Announce {
                reason: format!("tracker returned status {status}"),
            });
        }

        let body = response.bytes().await?;
        self.parse_announce_response(&body)
    }
}

/// Decodes a compact peer list: 6 bytes per entry, IPv4 then a big-endian
/// port.
///
/// Parsing is lenient: trailing bytes that do not form a full entry are
/// ignored, and entries advertising port 0 are skipped since they cannot
/// be dialed.
pub(crate) fn parse_compact_peers(peer_bytes: &[u8]) -> Vec<SocketAddr> {
    let mut peers = Vec::with_capacity(peer_bytes.len() / 6);
    for chunk in peer_bytes.chunks_exact(6) {
        let port = u16::from_be_bytes([chunk[4], chunk[5]]);
        if port == 0 {
            continue;
        }
        let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
        peers.push(SocketAddr::V4(SocketAddrV4::new(ip, port)));
    }
    peers
}

/// Percent-encodes every byte for tracker query parameters.
pub(crate) fn url_encode_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| format!("%{b:02X}")).collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn test_request(tracker_id: Option<Vec<u8>>) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: InfoHash::new([0x01; 20]),
            peer_id: PeerId::new(*b"-EB0001-aaaabbbbcccc"),
            port: 6881,
            uploaded: 0,
            downloaded: 512,
            left: 1024,
            tracker_id,
        }
    }

    #[test]
    fn test_url_encode_bytes_binary() {
        let encoded = url_encode_bytes(&[0x00, 0xFF, 0x7F, 0x80, 0x01]);
        assert_eq!(encoded, "%00%FF%7F%80%01");
    }

    #[test]
    fn test_build_announce_url() {
        let client = HttpAnnounceClient::new(
            "http://t.example/announce".to_string(),
            &NetworkConfig::default(),
        );

        let url = client.build_announce_url(&test_request(None));
        assert!(url.starts_with("http://t.example/announce?info_hash=%01%01"));
        assert!(url.contains("&peer_id=%2D%45%42"));
        assert!(url.contains("&port=6881"));
        assert!(url.contains("&downloaded=512"));
        assert!(url.contains("&left=1024"));
        assert!(url.contains("&compact=1"));
        assert!(!url.contains("event="), "no event parameter is sent");
        assert!(!url.contains("trackerid="));
    }

    #[test]
    fn test_build_announce_url_echoes_tracker_id() {
        let client = HttpAnnounceClient::new(
            "http://t.example/announce".to_string(),
            &NetworkConfig::default(),
        );

        let url = client.build_announce_url(&test_request(Some(b"xyz".to_vec())));
        assert!(url.ends_with("&trackerid=%78%79%7A"));
    }

    #[test]
    fn test_parse_compact_peers() {
        let blob = [10, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 2, 0x1A, 0xE2];
        let peers = parse_compact_peers(&blob);
        assert_eq!(
            peers,
            vec![
                SocketAddr::from(([10, 0, 0, 1], 6881)),
                SocketAddr::from(([10, 0, 0, 2], 6882)),
            ]
        );
    }

    #[test]
    fn test_parse_compact_peers_ignores_trailing_bytes() {
        let mut blob = vec![10, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 2, 0x1A, 0xE2];
        blob.push(99);
        let peers = parse_compact_peers(&blob);
        assert_eq!(peers.len(), 2, "13 bytes yield floor(13/6) entries");
    }

    #[test]
    fn test_parse_compact_peers_skips_port_zero() {
        let blob = [10, 0, 0, 1, 0, 0, 10, 0, 0, 2, 0x1A, 0xE2];
        let peers = parse_compact_peers(&blob);
        assert_eq!(peers, vec![SocketAddr::from(([10, 0, 0, 2], 6882))]);
    }

    #[test]
    fn test_parse_compact_peers_empty() {
        assert!(parse_compact_peers(&[]).is_empty());
    }

    #[test]
    fn test_parse_announce_response() {
        let client = HttpAnnounceClient::new(
            "http://t.example/announce".to_string(),
            &NetworkConfig::default(),
        );

        let mut body = b"d8:intervali900e5:peers12:".to_vec();
        body.extend_from_slice(&[10, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 2, 0x1A, 0xE2]);
        body.push(b'e');

        let response = client.parse_announce_response(&body).unwrap();
        assert_eq!(response.interval, 900);
        assert_eq!(response.peers.len(), 2);
        assert!(response.tracker_id.is_none());
    }

    #[test]
    fn test_parse_announce_response_failure_reason() {
        let client = HttpAnnounceClient::new(
            "http://t.example/announce".to_string(),
            &NetworkConfig::default(),
        );

        let result = client.parse_announce_response(b"d14:failure reason9:not founde");
        match result {
            Err(TorrentError::Announce { reason }) => assert_eq!(reason, "not found"),
            other => panic!("expected announce failure, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_announce_response_defaults() {
        let client = HttpAnnounceClient::new(
            "http://t.example/announce".to_string(),
            &NetworkConfig::default(),
        );

        let response = client
            .parse_announce_response(b"d10:tracker id3:xyze")
            .unwrap();
        assert_eq!(response.interval, 0, "missing interval defaults to zero");
        assert_eq!(response.tracker_id, Some(b"xyz".to_vec()));
        assert!(response.peers.is_empty());
    }

    proptest! {
        #[test]
        fn test_compact_parsing_is_lenient(bytes: Vec<u8>) {
            let peers = parse_compact_peers(&bytes);
            prop_assert!(peers.len() <= bytes.len() / 6);
            for peer in peers {
                prop_assert!(peer.port() != 0);
            }
        }
    }
}
