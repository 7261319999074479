//! Durable storage behind the ledger

use crate::{AuditEvent, StreamId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// May succeed if retried
    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("store failure: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            IoErrorKind::Interrupted | IoErrorKind::WouldBlock | IoErrorKind::TimedOut => {
                StoreError::Transient(err.to_string())
            }
            _ => StoreError::Permanent(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Permanent(err.to_string())
    }
}

/// Append-only event storage.
///
/// `persist` must be durable when it returns `Ok`; the ledger treats that as
/// the commit point of the event.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn persist(&self, event: &AuditEvent) -> Result<(), StoreError>;

    /// All events of a stream in sequence order.
    async fn load(&self, stream: &StreamId) -> Result<Vec<AuditEvent>, StoreError>;

    async fn streams(&self) -> Result<Vec<StreamId>, StoreError>;
}

/// In-memory store, for tests and the demo engine.
#[derive(Default)]
pub struct MemoryAuditStore {
    streams: RwLock<BTreeMap<StreamId, Vec<AuditEvent>>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.streams.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Direct access to stored events, bypassing the chain.
    pub(crate) fn with_stream_mut<R>(
        &self,
        stream: &StreamId,
        f: impl FnOnce(&mut Vec<AuditEvent>) -> R,
    ) -> R {
        let mut streams = self.streams.write();
        f(streams.entry(stream.clone()).or_default())
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn persist(&self, event: &AuditEvent) -> Result<(), StoreError> {
        self.streams
            .write()
            .entry(event.stream.clone())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn load(&self, stream: &StreamId) -> Result<Vec<AuditEvent>, StoreError> {
        Ok(self.streams.read().get(stream).cloned().unwrap_or_default())
    }

    async fn streams(&self) -> Result<Vec<StreamId>, StoreError> {
        Ok(self.streams.read().keys().cloned().collect())
    }
}

/// Line-delimited JSON file, one event per line, opened in append mode.
pub struct JsonlAuditStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlAuditStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<AuditEvent>, StoreError> {
        let file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut lines = BufReader::new(file).lines();
        let mut events = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(&line)?);
        }
        Ok(events)
    }
}

#[async_trait]
impl AuditStore for JsonlAuditStore {
    async fn persist(&self, event: &AuditEvent) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;
        Ok(())
    }

    /// Events come back in file order so a reordered file fails verification.
    async fn load(&self, stream: &StreamId) -> Result<Vec<AuditEvent>, StoreError> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|e| &e.stream == stream)
            .collect())
    }

    async fn streams(&self) -> Result<Vec<StreamId>, StoreError> {
        let streams: BTreeSet<StreamId> = self
            .read_all()
            .await?
            .into_iter()
            .map(|e| e.stream)
            .collect();
        Ok(streams.into_iter().collect())
    }
}
