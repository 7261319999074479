mod common;

use common::{harness, step};
use labflow_engine::EngineError;
use labflow_ledger::{StoreError, StreamId};
use labflow_types::{ErrorKind, StepPayload};
use serde_json::json;

#[tokio::test]
async fn tampered_stream_freezes_the_run() {
    let h = harness().await;
    let orch = &h.orchestrator;
    let run_id = h.start().await;
    orch.submit_result(
        &run_id,
        &step("prepare"),
        StepPayload::new().with_operator("alice").with_reagent_lot("LOT-1"),
        None,
    )
    .await
    .unwrap();
    assert!(orch.verify(&run_id).await.unwrap());

    h.store.tamper(&StreamId::run(&run_id), |events| {
        events[2].payload = json!({ "state": "RUNNING", "detail": { "reagent_lot": "LOT-X" } });
    });

    assert!(!orch.verify(&run_id).await.unwrap());
    assert!(orch.snapshot(&run_id).await.unwrap().frozen);

    let err = orch.advance(&run_id).await.unwrap_err();
    assert!(matches!(err, EngineError::RunFrozen(_)));
    assert_eq!(err.kind(), ErrorKind::Integrity);

    let report = orch
        .ledger()
        .verify_report(&StreamId::run(&run_id))
        .await
        .unwrap();
    assert_eq!(report.first_invalid_seq, Some(3));
}

#[tokio::test]
async fn failed_audit_write_rolls_the_transition_back() {
    let h = harness().await;
    let orch = &h.orchestrator;
    let run_id = h.start().await;
    let before = orch.snapshot(&run_id).await.unwrap();

    h.store
        .fail_next(10, StoreError::Permanent("disk full".into()));
    let err = orch
        .submit_result(
            &run_id,
            &step("prepare"),
            StepPayload::new().with_operator("alice").with_reagent_lot("LOT-1"),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AuditWriteFailed { .. }));
    assert_eq!(err.kind(), ErrorKind::Infrastructure);
    assert!(err.is_retryable());
    assert_eq!(orch.snapshot(&run_id).await.unwrap(), before);

    h.store.heal();
    orch.submit_result(
        &run_id,
        &step("prepare"),
        StepPayload::new().with_operator("alice").with_reagent_lot("LOT-1"),
        None,
    )
    .await
    .unwrap();
    let after = orch.snapshot(&run_id).await.unwrap();
    assert_eq!(after.version, before.version + 1);
    assert!(orch.verify(&run_id).await.unwrap());
}

#[tokio::test]
async fn transient_write_failures_are_retried() {
    let h = harness().await;
    let orch = &h.orchestrator;
    let run_id = h.start().await;

    h.store
        .fail_next(2, StoreError::Transient("timeout".into()));
    orch.submit_result(
        &run_id,
        &step("prepare"),
        StepPayload::new().with_operator("alice").with_reagent_lot("LOT-1"),
        None,
    )
    .await
    .unwrap();
    assert!(orch.verify(&run_id).await.unwrap());
}

#[tokio::test]
async fn exported_run_round_trips_through_a_file() {
    let h = harness().await;
    let orch = &h.orchestrator;
    let run_id = h.start().await;
    h.through_review(&run_id).await;
    h.read(&run_id, 100.5).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.jsonl");
    let export = orch.export_run(&run_id).await.unwrap();
    labflow_ledger::write_export(&path, &export).await.unwrap();

    let back = labflow_ledger::read_export(&path).await.unwrap();
    assert!(back.verify().is_valid());
    assert_eq!(back.run.id, run_id);
    assert_eq!(back.events.len(), export.events.len());
}

#[tokio::test]
async fn failed_hold_leaves_no_deviation_behind() {
    let h = harness().await;
    let orch = &h.orchestrator;
    let run_id = h.start().await;
    let before = orch.snapshot(&run_id).await.unwrap();

    h.store
        .fail_event_type("step_failed", StoreError::Permanent("disk full".into()));
    // nothing staged, so the first step fails its input checks
    let err = orch.advance(&run_id).await.unwrap_err();
    assert!(matches!(err, EngineError::AuditWriteFailed { .. }));

    let run = orch.snapshot(&run_id).await.unwrap();
    assert_eq!(run, before);
    assert!(run.records.is_empty());
    assert!(orch.deviations().for_run(&run_id).await.is_empty());
    assert!(orch.verify(&run_id).await.unwrap());

    h.store.heal();
    let err = orch.advance(&run_id).await.unwrap_err();
    let capa_id = match err {
        EngineError::StepExecutionFailed { capa_id, .. } => capa_id,
        other => panic!("unexpected {other:?}"),
    };
    let capas = orch.deviations().for_run(&run_id).await;
    assert_eq!(capas.len(), 1);
    assert_eq!(capas[0].id, capa_id);
    assert_eq!(
        orch.snapshot(&run_id).await.unwrap().hold.map(|hold| hold.capa_id),
        Some(capa_id)
    );
}

#[tokio::test]
async fn unrecordable_deviation_freezes_the_held_run() {
    let h = harness().await;
    let orch = &h.orchestrator;
    let run_id = h.start().await;

    h.store
        .fail_event_type("capa_opened", StoreError::Permanent("disk full".into()));
    let err = orch.advance(&run_id).await.unwrap_err();
    assert!(matches!(err, EngineError::Deviation { .. }));

    let run = orch.snapshot(&run_id).await.unwrap();
    assert!(run.frozen);
    assert_eq!(run.state, labflow_types::RunState::Hold);
    assert!(orch.deviations().for_run(&run_id).await.is_empty());
    assert!(matches!(
        orch.advance(&run_id).await,
        Err(EngineError::RunFrozen(_))
    ));
}
