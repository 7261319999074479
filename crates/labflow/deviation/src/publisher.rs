//! Outbound CAPA events for external tracking systems

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use labflow_types::{CapaId, CapaRecord, CapaState, RunId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// A CAPA state change. Consumers deduplicate on `(capa_id, state)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapaEvent {
    pub capa_id: CapaId,
    pub run_id: RunId,
    pub state: CapaState,
    pub occurred_at: DateTime<Utc>,
    pub record: CapaRecord,
}

impl CapaEvent {
    pub fn of(record: &CapaRecord) -> Self {
        Self {
            capa_id: record.id.clone(),
            run_id: record.run_id().clone(),
            state: record.state,
            occurred_at: record.updated_at,
            record: record.clone(),
        }
    }

    pub fn dedupe_key(&self) -> (CapaId, CapaState) {
        (self.capa_id.clone(), self.state)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("CAPA delivery failed: {0}")]
pub struct PublishError(pub String);

#[async_trait]
pub trait CapaPublisher: Send + Sync {
    /// Deliver one event. `Ok` means the receiver acknowledged it.
    async fn publish(&self, event: &CapaEvent) -> Result<(), PublishError>;
}

/// Discards every event; for deployments without an external tracker.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullCapaPublisher;

#[async_trait]
impl CapaPublisher for NullCapaPublisher {
    async fn publish(&self, _event: &CapaEvent) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Hands events to an in-process consumer over a channel.
pub struct ChannelCapaPublisher {
    tx: mpsc::UnboundedSender<CapaEvent>,
}

impl ChannelCapaPublisher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CapaEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl CapaPublisher for ChannelCapaPublisher {
    async fn publish(&self, event: &CapaEvent) -> Result<(), PublishError> {
        self.tx
            .send(event.clone())
            .map_err(|_| PublishError("receiver dropped".into()))
    }
}
