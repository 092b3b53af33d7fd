//! Streamed file uploads.
//!
//! Upload fragments are written straight to storage at their own offset, so
//! they may arrive in any order and a failed fragment can be resent alone.
//! The tracker records which byte ranges of each file have landed and
//! reports completion once the whole length is covered. Finished uploads are
//! remembered for a while so a retried fragment is acknowledged again
//! without starting a new upload.

use crate::session::ConnectionId;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use svcwire_protocol::UploadFragment;
use thiserror::Error;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

/// How long a finished upload id keeps absorbing retried fragments.
const COMPLETED_RETENTION: Duration = Duration::from_secs(120);

/// Upload errors.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("uploads are disabled")]
    Disabled,

    #[error("invalid upload path: {0}")]
    InvalidPath(String),

    #[error("upload does not match earlier fragments: {0}")]
    Mismatch(String),

    #[error("fragment at {offset} (+{len}) exceeds file length {length}")]
    OutOfRange { offset: u64, len: u64, length: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    /// Fatal errors fail the whole upload; others only the fragment.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, UploadError::Io(_))
    }
}

/// Destination of uploaded bytes.
#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Writes `bytes` at `offset` of `file_path`, creating the file if
    /// needed. Returns the number of bytes written.
    async fn write_range(&self, file_path: &str, offset: u64, bytes: &[u8]) -> Result<u64, UploadError>;
}

/// Stores uploads below a root directory.
#[derive(Debug, Clone)]
pub struct LocalFileStorage {
    root: PathBuf,
}

impl LocalFileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a client path below the root. Absolute paths and `..` are
    /// rejected.
    pub fn resolve(&self, file_path: &str) -> Result<PathBuf, UploadError> {
        let relative = Path::new(file_path);
        let mut has_name = false;
        for component in relative.components() {
            match component {
                Component::Normal(_) => has_name = true,
                Component::CurDir => {}
                _ => return Err(UploadError::InvalidPath(file_path.to_string())),
            }
        }
        if !has_name {
            return Err(UploadError::InvalidPath(file_path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl FileStorage for LocalFileStorage {
    async fn write_range(&self, file_path: &str, offset: u64, bytes: &[u8]) -> Result<u64, UploadError> {
        let path = self.resolve(file_path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        Ok(bytes.len() as u64)
    }
}

/// Outcome of accepting one fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadProgress {
    Partial { received: u64, length: u64 },
    Complete { file_path: String, size: u64 },
    /// The upload already completed; the fragment was not written again.
    AlreadyComplete,
}

struct Transfer {
    file_path: String,
    length: u64,
    /// Disjoint covered ranges, start to end.
    ranges: BTreeMap<u64, u64>,
}

impl Transfer {
    fn covered(&self) -> u64 {
        self.ranges.iter().map(|(start, end)| end - start).sum()
    }

    fn mark(&mut self, start: u64, end: u64) {
        if start == end {
            return;
        }
        let (mut start, mut end) = (start, end);
        let touching: Vec<u64> = self
            .ranges
            .range(..=end)
            .filter(|(_, e)| **e >= start)
            .map(|(s, _)| *s)
            .collect();
        for s in touching {
            if let Some(e) = self.ranges.remove(&s) {
                start = start.min(s);
                end = end.max(e);
            }
        }
        self.ranges.insert(start, end);
    }
}

/// Tracks in-flight uploads per connection and request id.
pub struct UploadTracker {
    storage: Arc<dyn FileStorage>,
    transfers: DashMap<(ConnectionId, u64), Transfer>,
    /// Recently completed uploads and when they completed.
    completed: DashMap<(ConnectionId, u64), Instant>,
}

impl UploadTracker {
    pub fn new(storage: Arc<dyn FileStorage>) -> Self {
        Self {
            storage,
            transfers: DashMap::new(),
            completed: DashMap::new(),
        }
    }

    fn is_completed(&self, key: &(ConnectionId, u64)) -> bool {
        self.completed
            .get(key)
            .is_some_and(|at| at.elapsed() < COMPLETED_RETENTION)
    }

    /// Writes one fragment and records its range.
    pub async fn accept(
        &self,
        connection: ConnectionId,
        fragment: &UploadFragment,
    ) -> Result<UploadProgress, UploadError> {
        let len = fragment.buffer.len() as u64;
        let end = fragment.offset.saturating_add(len);
        if end > fragment.length {
            return Err(UploadError::OutOfRange {
                offset: fragment.offset,
                len,
                length: fragment.length,
            });
        }

        let key = (connection, fragment.id);
        if self.is_completed(&key) {
            debug!(connection, id = fragment.id, offset = fragment.offset, "fragment of finished upload");
            return Ok(UploadProgress::AlreadyComplete);
        }
        {
            let transfer = self.transfers.entry(key).or_insert_with(|| Transfer {
                file_path: fragment.file_path.clone(),
                length: fragment.length,
                ranges: BTreeMap::new(),
            });
            if transfer.file_path != fragment.file_path || transfer.length != fragment.length {
                return Err(UploadError::Mismatch(format!(
                    "expected {} ({} bytes)",
                    transfer.file_path, transfer.length
                )));
            }
        }

        self.storage
            .write_range(&fragment.file_path, fragment.offset, &fragment.buffer)
            .await?;

        let received = match self.transfers.get_mut(&key) {
            Some(mut transfer) => {
                transfer.mark(fragment.offset, end);
                transfer.covered()
            }
            None if self.is_completed(&key) => return Ok(UploadProgress::AlreadyComplete),
            // Aborted while the write was in flight.
            None => return Err(UploadError::Mismatch("upload aborted".into())),
        };
        debug!(
            connection,
            id = fragment.id,
            offset = fragment.offset,
            received,
            length = fragment.length,
            "upload fragment stored"
        );

        if received < fragment.length {
            return Ok(UploadProgress::Partial {
                received,
                length: fragment.length,
            });
        }
        // Concurrent final fragments complete the upload once.
        self.completed
            .retain(|_, at| at.elapsed() < COMPLETED_RETENTION);
        self.completed.insert(key, Instant::now());
        if self.transfers.remove(&key).is_none() {
            return Ok(UploadProgress::AlreadyComplete);
        }
        info!(connection, file = %fragment.file_path, size = fragment.length, "upload complete");
        Ok(UploadProgress::Complete {
            file_path: fragment.file_path.clone(),
            size: fragment.length,
        })
    }

    /// Forgets an upload after a fatal error.
    pub fn abort(&self, connection: ConnectionId, id: u64) -> bool {
        self.transfers.remove(&(connection, id)).is_some()
    }

    /// Forgets every unfinished upload of a connection.
    pub fn abort_for(&self, connection: ConnectionId) -> usize {
        self.completed.retain(|(conn, _), _| *conn != connection);
        let before = self.transfers.len();
        self.transfers.retain(|(conn, _), _| *conn != connection);
        before.saturating_sub(self.transfers.len())
    }

    pub fn in_flight(&self) -> usize {
        self.transfers.len()
    }
}
