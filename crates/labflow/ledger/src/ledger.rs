//! The audit ledger: per-stream serialised, hash-chained appends

use crate::verify::{verify_chain, ChainReport};
use crate::{AuditEvent, AuditStore, LedgerError, LedgerResult, MemoryAuditStore, StreamId};
use dashmap::DashMap;
use labflow_types::Digest;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// How often a transient store failure is retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Delay before retry `n` is `backoff * n`
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(25),
        }
    }
}

#[derive(Debug)]
struct StreamHead {
    loaded: bool,
    last_seq: u64,
    last_hash: Digest,
    sealed: bool,
}

impl Default for StreamHead {
    fn default() -> Self {
        Self {
            loaded: false,
            last_seq: 0,
            last_hash: Digest::ZERO,
            sealed: false,
        }
    }
}

/// Append-only, hash-chained audit ledger.
///
/// Appends to the same stream are serialised by a per-stream lock; appends
/// to different streams proceed independently.
pub struct AuditLedger {
    store: Arc<dyn AuditStore>,
    heads: DashMap<StreamId, Arc<Mutex<StreamHead>>>,
    retry: RetryPolicy,
}

impl AuditLedger {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self {
            store,
            heads: DashMap::new(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryAuditStore::new()))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = RetryPolicy {
            attempts: retry.attempts.max(1),
            backoff: retry.backoff,
        };
        self
    }

    pub fn store(&self) -> &Arc<dyn AuditStore> {
        &self.store
    }

    fn head(&self, stream: &StreamId) -> Arc<Mutex<StreamHead>> {
        self.heads
            .entry(stream.clone())
            .or_insert_with(|| Arc::new(Mutex::new(StreamHead::default())))
            .clone()
    }

    async fn load_head(&self, stream: &StreamId, head: &mut StreamHead) -> LedgerResult<()> {
        if head.loaded {
            return Ok(());
        }
        let events = self
            .store
            .load(stream)
            .await
            .map_err(|source| LedgerError::Read {
                stream: stream.clone(),
                source,
            })?;
        // storage order is not trusted here; verification reports it
        if let Some(last) = events.iter().max_by_key(|e| e.seq) {
            head.last_seq = last.seq;
            head.last_hash = last.hash;
        }
        head.loaded = true;
        Ok(())
    }

    /// Append an event and return it once it is durably stored.
    pub async fn append(
        &self,
        stream: &StreamId,
        event_type: &str,
        payload: serde_json::Value,
    ) -> LedgerResult<AuditEvent> {
        self.append_inner(stream, event_type, payload, false).await
    }

    /// Append a final event and seal the stream in the same critical section.
    pub async fn append_sealing(
        &self,
        stream: &StreamId,
        event_type: &str,
        payload: serde_json::Value,
    ) -> LedgerResult<AuditEvent> {
        self.append_inner(stream, event_type, payload, true).await
    }

    async fn append_inner(
        &self,
        stream: &StreamId,
        event_type: &str,
        payload: serde_json::Value,
        seal: bool,
    ) -> LedgerResult<AuditEvent> {
        let head = self.head(stream);
        let mut head = head.lock().await;
        self.load_head(stream, &mut head).await?;

        if head.sealed {
            return Err(LedgerError::StreamSealed(stream.clone()));
        }

        let event = AuditEvent::chained(
            head.last_seq + 1,
            stream.clone(),
            event_type,
            payload,
            head.last_hash,
        );
        self.persist_with_retry(&event).await?;

        head.last_seq = event.seq;
        head.last_hash = event.hash;
        if seal {
            head.sealed = true;
        }

        debug!(stream = %stream, seq = event.seq, event_type, hash = %event.hash.short(), "Audit event appended");
        Ok(event)
    }

    async fn persist_with_retry(&self, event: &AuditEvent) -> LedgerResult<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.persist(event).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempt < self.retry.attempts => {
                    warn!(
                        stream = %event.stream,
                        seq = event.seq,
                        attempt,
                        error = %err,
                        "Audit write failed, retrying"
                    );
                    tokio::time::sleep(self.retry.backoff * attempt).await;
                }
                Err(err) => {
                    error!(
                        stream = %event.stream,
                        seq = event.seq,
                        attempts = attempt,
                        error = %err,
                        "Audit write failed"
                    );
                    return Err(LedgerError::WriteFailed {
                        stream: event.stream.clone(),
                        attempts: attempt,
                        reason: err.to_string(),
                    });
                }
            }
        }
    }

    /// Close a stream to further appends.
    pub async fn seal(&self, stream: &StreamId) -> LedgerResult<()> {
        let head = self.head(stream);
        let mut head = head.lock().await;
        self.load_head(stream, &mut head).await?;
        head.sealed = true;
        info!(stream = %stream, events = head.last_seq, "Audit stream sealed");
        Ok(())
    }

    pub async fn is_sealed(&self, stream: &StreamId) -> bool {
        match self.heads.get(stream).map(|h| h.clone()) {
            Some(head) => head.lock().await.sealed,
            None => false,
        }
    }

    /// All stored events of a stream, oldest first.
    pub async fn events(&self, stream: &StreamId) -> LedgerResult<Vec<AuditEvent>> {
        self.store
            .load(stream)
            .await
            .map_err(|source| LedgerError::Read {
                stream: stream.clone(),
                source,
            })
    }

    /// Re-read the stream from storage and recompute its chain.
    pub async fn verify_report(&self, stream: &StreamId) -> LedgerResult<ChainReport> {
        let events = self.events(stream).await?;
        let report = verify_chain(&events);
        if let Some(fault) = &report.fault {
            error!(
                stream = %stream,
                seq = ?report.first_invalid_seq,
                fault = %fault,
                "Audit chain verification failed"
            );
        }
        Ok(report)
    }

    pub async fn verify(&self, stream: &StreamId) -> LedgerResult<bool> {
        Ok(self.verify_report(stream).await?.is_valid())
    }

    /// Load every stream head from storage, e.g. after a restart.
    ///
    /// Returns the number of streams found.
    pub async fn recover(&self) -> LedgerResult<usize> {
        let streams = self.store.streams().await.map_err(|source| LedgerError::Read {
            stream: StreamId::new("*"),
            source,
        })?;
        for stream in &streams {
            let head = self.head(stream);
            let mut head = head.lock().await;
            head.loaded = false;
            self.load_head(stream, &mut head).await?;
        }
        info!(streams = streams.len(), "Audit ledger recovered");
        Ok(streams.len())
    }
}
