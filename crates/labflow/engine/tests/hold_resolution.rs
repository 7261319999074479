mod common;

use common::harness;
use labflow_engine::{EngineError, HoldResolution, StepOutcome};
use labflow_types::{Actor, RunState};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn hold_lifts_only_once_the_capa_is_closed(
        notes in "[A-Za-z0-9 .,;-]{1,80}".prop_filter("non-blank", |s| !s.trim().is_empty()),
        attempts in 1usize..4,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let h = harness().await;
            let orch = &h.orchestrator;
            let run_id = h.start().await;
            h.through_review(&run_id).await;
            let capa = match h.read(&run_id, 107.0).await {
                StepOutcome::Held { capa, .. } => capa,
                other => panic!("expected a hold, got {other:?}"),
            };

            for _ in 0..attempts {
                let err = orch
                    .resolve_hold(&run_id, HoldResolution::DeviationClosed)
                    .await
                    .unwrap_err();
                assert!(matches!(err, EngineError::UnresolvedDeviation { .. }));
            }

            orch.deviations()
                .close(&capa.id, &notes, &Actor::new("qa").with_role("qa_reviewer"))
                .await
                .unwrap();
            let run = orch
                .resolve_hold(&run_id, HoldResolution::DeviationClosed)
                .await
                .unwrap();
            assert_eq!(run.state, RunState::Running);
            assert!(matches!(
                orch.advance(&run_id).await.unwrap(),
                StepOutcome::RunCompleted { .. }
            ));
        });
    }
}
