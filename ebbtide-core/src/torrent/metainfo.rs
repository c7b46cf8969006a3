//! Torrent descriptor parsing and canonical info hash calculation

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_bencode::value::Value;
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use super::{InfoHash, TorrentError};

/// Complete metadata extracted from a torrent descriptor.
///
/// Carries everything the engine needs to announce and connect: tracker
/// URLs, piece hashes, file layout and the canonical info hash. Parsed
/// once at load time and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metainfo {
    pub announce: String,
    pub announce_list: Vec<String>,
    pub creation_date: Option<DateTime<Utc>>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u32,
    pub pieces: Vec<[u8; 20]>,
    pub private: bool,
    pub files: Vec<FileEntry>,
}

/// Individual file within a torrent.
///
/// Single-file torrents synthesize one entry whose path is the torrent
/// name; multi-file torrents join the name with each path segment list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub length: u64,
    pub path: PathBuf,
}

// Raw serde shapes matching the descriptor schema. Field access goes
// through `Metainfo`; these only exist for the typed decode pass.
#[derive(Debug, Deserialize)]
struct RawMetainfo {
    announce: String,
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
    #[serde(rename = "creation date")]
    creation_date: Option<i64>,
    comment: Option<String>,
    #[serde(rename = "created-by")]
    created_by: Option<String>,
    info: RawInfo,
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    name: String,
    #[serde(rename = "piece length")]
    piece_length: i64,
    pieces: ByteBuf,
    private: Option<i64>,
    length: Option<i64>,
    files: Option<Vec<RawFile>>,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    length: i64,
    path: Vec<String>,
}

impl Metainfo {
    /// Reads and parses a torrent descriptor from disk.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Io` - If the file cannot be read
    /// - `TorrentError::Decode` / `TorrentError::Schema` - If parsing fails
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, TorrentError> {
        let bytes = tokio::fs::read(path.as_ref()).await?;
        Self::from_bytes(&bytes)
    }

    /// Parses a torrent descriptor from raw bencode bytes.
    ///
    /// The info hash is computed from the generic decode by re-encoding the
    /// info dictionary canonically, so keys the typed model does not know
    /// about still contribute to the hash.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Decode` - If the input is not valid bencode
    /// - `TorrentError::Schema` - If a required field is missing or mistyped
    /// - `TorrentError::Hash` - If the info dictionary cannot be re-encoded
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TorrentError> {
        let info_hash = compute_info_hash(bytes)?;

        let raw: RawMetainfo =
            serde_bencode::from_bytes(bytes).map_err(|e| TorrentError::Schema {
                reason: e.to_string(),
            })?;

        let piece_length =
            u32::try_from(raw.info.piece_length).map_err(|_| TorrentError::Schema {
                reason: "'piece length' out of range".to_string(),
            })?;

        if !raw.info.pieces.len().is_multiple_of(20) {
            return Err(TorrentError::Schema {
                reason: format!("'pieces' length {} is not a multiple of 20", raw.info.pieces.len()),
            });
        }
        let pieces: Vec<[u8; 20]> = raw
            .info
            .pieces
            .chunks(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let files = build_file_entries(&raw.info)?;

        let mut announce_list = vec![raw.announce.clone()];
        if let Some(tiers) = &raw.announce_list {
            for tier in tiers {
                if let Some(url) = tier.first()
                    && !announce_list.contains(url)
                {
                    announce_list.push(url.clone());
                }
            }
        }

        Ok(Self {
            announce: raw.announce,
            announce_list,
            creation_date: raw
                .creation_date
                .and_then(|secs| DateTime::from_timestamp(secs, 0)),
            comment: raw.comment,
            created_by: raw.created_by,
            info_hash,
            name: raw.info.name,
            piece_length,
            pieces,
            private: raw.info.private.unwrap_or(0) != 0,
            files,
        })
    }

    /// Total payload size in bytes, summed over all file entries.
    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|file| file.length).sum()
    }

    /// Number of pieces the payload is divided into.
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }
}

/// SHA-1 of the canonically re-encoded info dictionary.
fn compute_info_hash(bytes: &[u8]) -> Result<InfoHash, TorrentError> {
    let root: Value = serde_bencode::from_bytes(bytes).map_err(|e| TorrentError::Decode {
        reason: e.to_string(),
    })?;

    let Value::Dict(dict) = root else {
        return Err(TorrentError::Schema {
            reason: "root element must be a dictionary".to_string(),
        });
    };

    let info = dict
        .get(b"info".as_slice())
        .ok_or_else(|| TorrentError::Schema {
            reason: "missing 'info' dictionary".to_string(),
        })?;

    let encoded = serde_bencode::to_bytes(info).map_err(|e| TorrentError::Hash {
        reason: e.to_string(),
    })?;

    let mut hasher = Sha1::new();
    hasher.update(&encoded);
    let digest = hasher.finalize();
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&digest);
    Ok(InfoHash::new(hash))
}

fn build_file_entries(info: &RawInfo) -> Result<Vec<FileEntry>, TorrentError> {
    if let Some(length) = info.length {
        let length = u64::try_from(length).map_err(|_| TorrentError::Schema {
            reason: "'length' must be non-negative".to_string(),
        })?;
        return Ok(vec![FileEntry {
            length,
            path: PathBuf::from(&info.name),
        }]);
    }

    let raw_files = info.files.as_ref().ok_or_else(|| TorrentError::Schema {
        reason: "missing 'length' or 'files' field".to_string(),
    })?;

    let mut files = Vec::with_capacity(raw_files.len());
    for raw in raw_files {
        let length = u64::try_from(raw.length).map_err(|_| TorrentError::Schema {
            reason: "file 'length' must be non-negative".to_string(),
        })?;
        let mut path = PathBuf::from(&info.name);
        for segment in &raw.path {
            path.push(segment);
        }
        files.push(FileEntry { length, path });
    }
    Ok(files)
}
