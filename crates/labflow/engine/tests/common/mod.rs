#![allow(dead_code)]

use labflow_deviation::RecordingCapaPublisher;
use labflow_engine::{build_with_store, EngineConfig, RunOrchestrator, StepOutcome};
use labflow_ledger::FlakyAuditStore;
use labflow_signature::{KeyringIdentityProvider, TestSigner};
use labflow_types::{
    ControlMeasurement, OperatorId, ProvenanceTag, RunId, SignatureMeaning, SopDefinition,
    SopKey, StepId, StepPayload, StepSpec,
};
use std::sync::Arc;

pub struct Harness {
    pub orchestrator: Arc<RunOrchestrator>,
    pub store: Arc<FlakyAuditStore>,
    pub publisher: Arc<RecordingCapaPublisher>,
    pub operator: TestSigner,
    pub reviewer: TestSigner,
    pub manager: TestSigner,
}

pub fn elisa() -> SopDefinition {
    SopDefinition::new("elisa", 1, "qa-author")
        .with_step(
            StepSpec::new("prepare", "Prepare plate")
                .with_required_input("operator")
                .with_required_input("reagent_lot"),
        )
        .unwrap()
        .with_step(
            StepSpec::new("review", "Review plate layout")
                .with_required_input("plate_layout")
                .with_signature(SignatureMeaning::Approved)
                .depends_on("prepare"),
        )
        .unwrap()
        .with_step(
            StepSpec::new("read", "Read plate")
                .with_required_input("instrument")
                .with_qc(["low"])
                .depends_on("review"),
        )
        .unwrap()
}

pub fn sop_key() -> SopKey {
    SopKey::new("elisa", 1)
}

pub async fn harness() -> Harness {
    harness_with(EngineConfig::development()).await
}

pub async fn harness_with(config: EngineConfig) -> Harness {
    let store = Arc::new(FlakyAuditStore::new());
    let keyring = Arc::new(KeyringIdentityProvider::new());
    let publisher = Arc::new(RecordingCapaPublisher::new());

    let operator = TestSigner::new("alice").with_role("analyst");
    let reviewer = TestSigner::new("bob").with_role("reviewer");
    let manager = TestSigner::new("carol").with_role("qa_manager");
    for signer in [&operator, &reviewer, &manager] {
        signer.register(&keyring);
    }

    let orchestrator = build_with_store(&config, store.clone(), keyring, publisher.clone())
        .await
        .unwrap();
    orchestrator.registry().publish(elisa()).unwrap();

    Harness {
        orchestrator,
        store,
        publisher,
        operator,
        reviewer,
        manager,
    }
}

pub fn step(id: &str) -> StepId {
    StepId::new(id)
}

pub fn reader() -> ProvenanceTag {
    ProvenanceTag::qualified("plate-reader-7", "sha256:4f2a")
}

impl Harness {
    pub async fn start(&self) -> RunId {
        self.orchestrator
            .start(&sop_key(), OperatorId::new("alice"))
            .await
            .unwrap()
            .id
    }

    /// Record "prepare" and the signed "review" step.
    pub async fn through_review(&self, run_id: &RunId) {
        let orch = &self.orchestrator;
        orch.submit_result(
            run_id,
            &step("prepare"),
            StepPayload::new()
                .with_operator("alice")
                .with_reagent_lot("LOT-2024-117"),
            None,
        )
        .await
        .unwrap();
        assert!(matches!(
            orch.advance(run_id).await.unwrap(),
            StepOutcome::Completed { .. }
        ));

        orch.submit_result(
            run_id,
            &step("review"),
            StepPayload::new().with_field("plate_layout", "standard-96"),
            None,
        )
        .await
        .unwrap();
        let pending = match orch.advance(run_id).await.unwrap() {
            StepOutcome::AwaitingSignature(pending) => pending,
            other => panic!("expected a signature request, got {other:?}"),
        };
        orch.submit_signature(run_id, &pending.id, &self.reviewer.approve(&pending))
            .await
            .unwrap();
        assert!(matches!(
            orch.advance(run_id).await.unwrap(),
            StepOutcome::Completed { .. }
        ));
    }

    /// Submit the control reading for "read" and advance.
    pub async fn read(&self, run_id: &RunId, low: f64) -> StepOutcome {
        self.orchestrator
            .submit_result(
                run_id,
                &step("read"),
                StepPayload::new().with_control(ControlMeasurement::new("low", low, 100.0, 2.0)),
                Some(reader()),
            )
            .await
            .unwrap();
        self.orchestrator.advance(run_id).await.unwrap()
    }
}
