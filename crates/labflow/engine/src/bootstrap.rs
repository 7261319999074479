//! Wiring: build an orchestrator from configuration

use crate::config::{EngineConfig, LedgerBackend};
use crate::{EngineError, EngineResult, RunOrchestrator, SopRegistry};
use labflow_deviation::{CapaPublisher, DeviationManager};
use labflow_ledger::{AuditLedger, AuditStore, JsonlAuditStore, MemoryAuditStore};
use labflow_qc::{QcHistory, QcRuleEngine, QcService};
use labflow_signature::{IdentityProvider, SignatureGate};
use std::sync::Arc;
use tracing::info;

/// Open the configured audit store and assemble the engine around it.
pub async fn build_orchestrator(
    config: &EngineConfig,
    identity: Arc<dyn IdentityProvider>,
    publisher: Arc<dyn CapaPublisher>,
) -> EngineResult<Arc<RunOrchestrator>> {
    let store: Arc<dyn AuditStore> = match &config.ledger.backend {
        LedgerBackend::Memory => Arc::new(MemoryAuditStore::new()),
        LedgerBackend::Jsonl { path } => {
            let store = JsonlAuditStore::open(path.clone()).await.map_err(|e| {
                EngineError::Config(format!("cannot open audit log {}: {e}", path.display()))
            })?;
            Arc::new(store)
        }
    };
    build_with_store(config, store, identity, publisher).await
}

/// Assemble the engine around an already-open audit store.
pub async fn build_with_store(
    config: &EngineConfig,
    store: Arc<dyn AuditStore>,
    identity: Arc<dyn IdentityProvider>,
    publisher: Arc<dyn CapaPublisher>,
) -> EngineResult<Arc<RunOrchestrator>> {
    let ledger = Arc::new(AuditLedger::new(store).with_retry(config.ledger.retry_policy()));
    let streams = ledger.recover().await?;

    let gate = Arc::new(SignatureGate::new(
        ledger.clone(),
        identity,
        config.signatures.gate_config(),
    ));
    let qc = Arc::new(QcService::new(
        QcRuleEngine::new(config.qc.clone()),
        Arc::new(QcHistory::new()),
        ledger.clone(),
    ));
    let deviations = Arc::new(DeviationManager::new(
        ledger.clone(),
        publisher,
        config.deviations.clone(),
    ));
    deviations.spawn_outbox_flusher();

    info!(
        streams,
        rules = config.qc.enabled_rules.len(),
        lock_timeout_ms = config.orchestrator.lock_timeout_ms,
        "Labflow engine ready"
    );
    Ok(Arc::new(RunOrchestrator::new(
        Arc::new(SopRegistry::new()),
        ledger,
        gate,
        qc,
        deviations,
        config.orchestrator.clone(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use labflow_deviation::NullCapaPublisher;
    use labflow_signature::KeyringIdentityProvider;

    #[tokio::test]
    async fn builds_in_memory_engine_from_defaults() {
        let orchestrator = build_orchestrator(
            &EngineConfig::default(),
            Arc::new(KeyringIdentityProvider::new()),
            Arc::new(NullCapaPublisher),
        )
        .await
        .unwrap();
        assert_eq!(orchestrator.registry().count(), 0);
        assert!(orchestrator.run_ids().is_empty());
    }

    #[tokio::test]
    async fn builds_on_jsonl_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.ledger.backend = LedgerBackend::Jsonl {
            path: dir.path().join("audit.jsonl"),
        };
        let orchestrator = build_orchestrator(
            &config,
            Arc::new(KeyringIdentityProvider::new()),
            Arc::new(NullCapaPublisher),
        )
        .await
        .unwrap();
        assert!(orchestrator.run_ids().is_empty());
    }
}
