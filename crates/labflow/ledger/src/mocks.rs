//! Test doubles for the audit store.

use crate::{AuditEvent, AuditStore, MemoryAuditStore, StoreError, StreamId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

/// In-memory store that can be told to fail and whose contents can be
/// edited behind the ledger's back.
#[derive(Default)]
pub struct FlakyAuditStore {
    inner: MemoryAuditStore,
    failures: Mutex<Option<(u32, StoreError)>>,
    failing_types: Mutex<Vec<(String, StoreError)>>,
    attempts: AtomicU32,
}

impl FlakyAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` persist calls with `error`.
    pub fn fail_next(&self, count: u32, error: StoreError) {
        *self.failures.lock() = if count == 0 { None } else { Some((count, error)) };
    }

    /// Fail every persist of events of `event_type` until healed.
    pub fn fail_event_type(&self, event_type: impl Into<String>, error: StoreError) {
        self.failing_types.lock().push((event_type.into(), error));
    }

    /// Stop injecting failures.
    pub fn heal(&self) {
        *self.failures.lock() = None;
        self.failing_types.lock().clear();
    }

    /// Number of persist calls seen, failed ones included.
    pub fn persist_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Mutate a stored stream directly, without re-chaining.
    pub fn tamper(&self, stream: &StreamId, f: impl FnOnce(&mut Vec<AuditEvent>)) {
        self.inner.with_stream_mut(stream, f)
    }

    fn take_failure(&self) -> Option<StoreError> {
        let mut failures = self.failures.lock();
        let (remaining, error) = failures.as_mut()?;
        let error = error.clone();
        *remaining -= 1;
        if *remaining == 0 {
            *failures = None;
        }
        Some(error)
    }
}

#[async_trait]
impl AuditStore for FlakyAuditStore {
    async fn persist(&self, event: &AuditEvent) -> Result<(), StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.take_failure() {
            return Err(error);
        }
        let typed = self
            .failing_types
            .lock()
            .iter()
            .find(|(event_type, _)| *event_type == event.event_type)
            .map(|(_, error)| error.clone());
        if let Some(error) = typed {
            return Err(error);
        }
        self.inner.persist(event).await
    }

    async fn load(&self, stream: &StreamId) -> Result<Vec<AuditEvent>, StoreError> {
        self.inner.load(stream).await
    }

    async fn streams(&self) -> Result<Vec<StreamId>, StoreError> {
        self.inner.streams().await
    }
}
