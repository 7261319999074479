//! CAPA lifecycle

use crate::{CapaEvent, CapaPublisher, DeviationError, DeviationResult};
use chrono::Utc;
use dashmap::DashMap;
use labflow_ledger::{AuditLedger, StreamId};
use labflow_types::{Actor, CapaId, CapaRecord, CapaState, DeviationTrigger, OperatorId, Role, RunId};
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviationConfig {
    /// Role a person must hold to close a CAPA record
    pub closure_role: Role,
    /// How often the background flusher retries undelivered events
    pub outbox_retry_ms: u64,
}

impl Default for DeviationConfig {
    fn default() -> Self {
        Self {
            closure_role: Role::new("qa_reviewer"),
            outbox_retry_ms: 5_000,
        }
    }
}

impl DeviationConfig {
    pub fn outbox_retry(&self) -> Duration {
        Duration::from_millis(self.outbox_retry_ms.max(1))
    }
}

pub struct DeviationManager {
    ledger: Arc<AuditLedger>,
    publisher: Arc<dyn CapaPublisher>,
    config: DeviationConfig,
    records: DashMap<CapaId, Arc<Mutex<CapaRecord>>>,
    outbox: SyncMutex<VecDeque<CapaEvent>>,
    outbox_ready: Arc<Notify>,
    flush_lock: Mutex<()>,
}

impl DeviationManager {
    pub fn new(
        ledger: Arc<AuditLedger>,
        publisher: Arc<dyn CapaPublisher>,
        config: DeviationConfig,
    ) -> Self {
        Self {
            ledger,
            publisher,
            config,
            records: DashMap::new(),
            outbox: SyncMutex::new(VecDeque::new()),
            outbox_ready: Arc::new(Notify::new()),
            flush_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &DeviationConfig {
        &self.config
    }

    fn slot(&self, id: &CapaId) -> DeviationResult<Arc<Mutex<CapaRecord>>> {
        self.records
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| DeviationError::NotFound(id.clone()))
    }

    /// Audit the new version of a record; the caller installs it on success.
    async fn commit(&self, event_type: &str, record: &CapaRecord, detail: serde_json::Value) -> DeviationResult<()> {
        self.ledger
            .append(
                &StreamId::capa(&record.id),
                event_type,
                json!({ "record": record, "detail": detail }),
            )
            .await?;
        self.outbox.lock().push_back(CapaEvent::of(record));
        self.outbox_ready.notify_one();
        Ok(())
    }

    /// Open a record in `OPEN` for the given trigger.
    pub async fn open(&self, trigger: DeviationTrigger) -> DeviationResult<CapaRecord> {
        self.open_record(CapaRecord::open(trigger)).await
    }

    /// Open a record whose id the caller already holds, e.g. one a run's
    /// hold already names.
    pub async fn open_record(&self, record: CapaRecord) -> DeviationResult<CapaRecord> {
        if record.state != CapaState::Open {
            return Err(DeviationError::InvalidTransition {
                capa: record.id.clone(),
                from: record.state,
                to: CapaState::Open,
            });
        }
        if self.records.contains_key(&record.id) {
            return Err(DeviationError::AlreadyOpened(record.id.clone()));
        }
        self.commit("capa_opened", &record, json!({})).await?;
        self.records
            .insert(record.id.clone(), Arc::new(Mutex::new(record.clone())));

        warn!(
            capa = %record.id,
            run_id = %record.run_id(),
            "Deviation opened"
        );
        Ok(record)
    }

    /// Move an `OPEN` record to `INVESTIGATING` under `owner`.
    pub async fn begin_investigation(
        &self,
        id: &CapaId,
        owner: OperatorId,
    ) -> DeviationResult<CapaRecord> {
        let slot = self.slot(id)?;
        let mut current = slot.lock().await;
        match current.state {
            CapaState::Open => {}
            CapaState::Closed => return Err(DeviationError::AlreadyClosed(id.clone())),
            from => {
                return Err(DeviationError::InvalidTransition {
                    capa: id.clone(),
                    from,
                    to: CapaState::Investigating,
                })
            }
        }

        let mut next = current.clone();
        next.state = CapaState::Investigating;
        next.owner = Some(owner.clone());
        next.updated_at = Utc::now();
        self.commit("capa_investigating", &next, json!({ "owner": owner }))
            .await?;
        *current = next.clone();

        info!(capa = %id, owner = %owner, "Deviation under investigation");
        Ok(next)
    }

    /// Assign or reassign the owner of a record that is not closed.
    pub async fn assign_owner(&self, id: &CapaId, owner: OperatorId) -> DeviationResult<CapaRecord> {
        let slot = self.slot(id)?;
        let mut current = slot.lock().await;
        if current.is_closed() {
            return Err(DeviationError::AlreadyClosed(id.clone()));
        }

        let mut next = current.clone();
        next.owner = Some(owner.clone());
        next.updated_at = Utc::now();
        self.commit("capa_owner_assigned", &next, json!({ "owner": owner }))
            .await?;
        *current = next.clone();

        info!(capa = %id, owner = %owner, "Deviation owner assigned");
        Ok(next)
    }

    /// Close a record. Requires non-blank notes and the closure role.
    pub async fn close(
        &self,
        id: &CapaId,
        notes: &str,
        closer: &Actor,
    ) -> DeviationResult<CapaRecord> {
        let slot = self.slot(id)?;
        let mut current = slot.lock().await;
        if current.is_closed() {
            return Err(DeviationError::AlreadyClosed(id.clone()));
        }
        if notes.trim().is_empty() {
            warn!(capa = %id, closer = %closer.id, "Closure refused: no resolution notes");
            return Err(DeviationError::UnauthorizedClosure {
                capa: id.clone(),
                reason: "resolution notes are required".into(),
            });
        }
        if !closer.has_role(&self.config.closure_role) {
            warn!(capa = %id, closer = %closer.id, "Closure refused: missing role");
            return Err(DeviationError::UnauthorizedClosure {
                capa: id.clone(),
                reason: format!("{} lacks role {}", closer.id, self.config.closure_role),
            });
        }

        let now = Utc::now();
        let mut next = current.clone();
        next.state = CapaState::Closed;
        next.resolution_notes = Some(notes.to_string());
        next.closed_by = Some(closer.id.clone());
        next.closed_at = Some(now);
        next.updated_at = now;
        self.commit("capa_closed", &next, json!({ "closer": closer })).await?;
        *current = next.clone();

        info!(capa = %id, closer = %closer.id, "Deviation closed");
        Ok(next)
    }

    pub async fn get(&self, id: &CapaId) -> Option<CapaRecord> {
        let slot = self.records.get(id).map(|r| r.value().clone())?;
        let record = slot.lock().await.clone();
        Some(record)
    }

    pub async fn for_run(&self, run_id: &RunId) -> Vec<CapaRecord> {
        let slots: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        let mut found = Vec::new();
        for slot in slots {
            let record = slot.lock().await;
            if record.run_id() == run_id {
                found.push(record.clone());
            }
        }
        found.sort_by_key(|r| r.opened_at);
        found
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.lock().len()
    }

    /// Deliver queued events in order until the outbox is empty or a
    /// delivery fails. Returns how many were acknowledged.
    pub async fn flush_outbox(&self) -> usize {
        let _flushing = self.flush_lock.lock().await;
        let mut delivered = 0;
        loop {
            let Some(event) = self.outbox.lock().front().cloned() else {
                break;
            };
            match self.publisher.publish(&event).await {
                Ok(()) => {
                    self.outbox.lock().pop_front();
                    delivered += 1;
                }
                Err(err) => {
                    warn!(
                        capa = %event.capa_id,
                        state = %event.state,
                        error = %err,
                        pending = self.outbox_len(),
                        "CAPA delivery failed, will retry on next flush"
                    );
                    break;
                }
            }
        }
        delivered
    }

    /// Deliver the outbox in the background: as soon as an event is queued,
    /// and again every `outbox_retry` while deliveries keep failing.
    ///
    /// The task ends once the manager is dropped.
    pub fn spawn_outbox_flusher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let ready = Arc::clone(&self.outbox_ready);
        let retry = self.config.outbox_retry();
        tokio::spawn(async move {
            loop {
                let Some(strong) = manager.upgrade() else {
                    break;
                };
                let delivered = strong.flush_outbox().await;
                if delivered > 0 {
                    debug!(delivered, pending = strong.outbox_len(), "CAPA events delivered");
                }
                drop(strong);
                let _ = tokio::time::timeout(retry, ready.notified()).await;
            }
        })
    }
}
