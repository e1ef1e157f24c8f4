//! Local state store.
//!
//! Snapshots hold the registry contents and the last known peers so a
//! restarted process can rejoin without waiting on gossip. On disk a
//! snapshot is a magic/version header followed by a zstd-compressed bincode
//! body, written to a temp file and renamed into place.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use murmur_core::{Error, ProcessIdentity, Result};

use crate::registry::RegistrationEntry;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

const MAGIC: &[u8; 8] = b"MURMUR01";
const HEADER_LEN: usize = MAGIC.len() + 4;
const COMPRESSION_LEVEL: i32 = 3;

/// What a process persists about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub process: ProcessIdentity,
    /// Incarnation at save time; a restart resumes above it.
    pub incarnation: u64,
    pub registry: Vec<RegistrationEntry>,
    pub peers: Vec<SocketAddr>,
}

impl NodeSnapshot {
    #[must_use]
    pub fn new(
        process: ProcessIdentity,
        incarnation: u64,
        registry: Vec<RegistrationEntry>,
        peers: Vec<SocketAddr>,
    ) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            process,
            incarnation,
            registry,
            peers,
        }
    }
}

/// Durable storage for a process's snapshot.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Replace the stored snapshot.
    async fn save(&self, snapshot: &NodeSnapshot) -> Result<()>;

    /// Load the stored snapshot, if any.
    async fn load(&self) -> Result<Option<NodeSnapshot>>;
}

/// Keeps the snapshot in memory. Used when no store path is configured.
#[derive(Default)]
pub struct InMemoryStateStore {
    snapshot: RwLock<Option<NodeSnapshot>>,
}

impl InMemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn save(&self, snapshot: &NodeSnapshot) -> Result<()> {
        *self.snapshot.write().await = Some(snapshot.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<NodeSnapshot>> {
        Ok(self.snapshot.read().await.clone())
    }
}

/// Snapshot file on local disk.
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn save(&self, snapshot: &NodeSnapshot) -> Result<()> {
        let bytes = encode(snapshot)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::storage(parent, e.to_string()))?;
        }
        let temp = self.temp_path();
        tokio::fs::write(&temp, &bytes)
            .await
            .map_err(|e| Error::storage(&temp, e.to_string()))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| Error::storage(&self.path, e.to_string()))?;
        debug!(
            path = %self.path.display(),
            bytes = bytes.len(),
            entries = snapshot.registry.len(),
            "snapshot saved"
        );
        Ok(())
    }

    async fn load(&self) -> Result<Option<NodeSnapshot>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::storage(&self.path, e.to_string())),
        };
        let snapshot = decode(&bytes).map_err(|e| Error::storage(&self.path, e.to_string()))?;
        info!(
            path = %self.path.display(),
            entries = snapshot.registry.len(),
            saved_at = %snapshot.saved_at,
            "snapshot loaded"
        );
        Ok(Some(snapshot))
    }
}

/// Header, then zstd(bincode(snapshot)).
///
/// # Errors
///
/// `Error::Codec` if serialization or compression fails.
pub fn encode(snapshot: &NodeSnapshot) -> Result<Vec<u8>> {
    let body = bincode::serde::encode_to_vec(snapshot, bincode::config::standard())
        .map_err(|e| Error::codec(format!("bincode encode failed: {e}")))?;
    let compressed = zstd::bulk::compress(&body, COMPRESSION_LEVEL)
        .map_err(|e| Error::codec(format!("zstd compression failed: {e}")))?;

    let mut out = Vec::with_capacity(HEADER_LEN + compressed.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Inverse of [`encode`].
///
/// # Errors
///
/// `Error::Codec` on a bad header, unsupported version, or corrupt body.
pub fn decode(bytes: &[u8]) -> Result<NodeSnapshot> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::codec(format!(
            "snapshot too short: {} bytes",
            bytes.len()
        )));
    }
    let (magic, rest) = bytes.split_at(MAGIC.len());
    if magic != MAGIC {
        return Err(Error::codec("bad snapshot magic"));
    }
    let (version, body) = rest.split_at(4);
    let mut version_bytes = [0u8; 4];
    version_bytes.copy_from_slice(version);
    let version = u32::from_le_bytes(version_bytes);
    if version != SNAPSHOT_VERSION {
        return Err(Error::codec(format!(
            "unsupported snapshot version {version}"
        )));
    }

    let decompressed = zstd::stream::decode_all(body)
        .map_err(|e| Error::codec(format!("zstd decompression failed: {e}")))?;
    let (snapshot, _) =
        bincode::serde::decode_from_slice(&decompressed, bincode::config::standard())
            .map_err(|e| Error::codec(format!("bincode decode failed: {e}")))?;
    Ok(snapshot)
}
