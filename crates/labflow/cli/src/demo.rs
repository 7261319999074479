//! Demonstration run: three steps, one signature, one QC gate

use anyhow::{bail, Context};
use labflow_deviation::ChannelCapaPublisher;
use labflow_engine::{build_orchestrator, EngineConfig, HoldResolution, StepOutcome};
use labflow_signature::{KeyringIdentityProvider, TestSigner};
use labflow_types::{
    Actor, ControlMeasurement, OperatorId, ProvenanceTag, SignatureMeaning, SopDefinition,
    StepId, StepPayload, StepSpec,
};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

fn procedure() -> anyhow::Result<SopDefinition> {
    Ok(SopDefinition::new("elisa-demo", 1, "qa-author")
        .with_description("Plate preparation, reviewed layout, control read")
        .with_step(
            StepSpec::new("prepare", "Prepare plate")
                .with_required_input("operator")
                .with_required_input("reagent_lot"),
        )?
        .with_step(
            StepSpec::new("review", "Review plate layout")
                .with_required_input("plate_layout")
                .with_signature(SignatureMeaning::Approved)
                .depends_on("prepare"),
        )?
        .with_step(
            StepSpec::new("read", "Read controls")
                .with_required_input("instrument")
                .with_qc(["low"])
                .depends_on("review"),
        )?)
}

pub async fn run(config: &EngineConfig, reading: f64, export: Option<&Path>) -> anyhow::Result<()> {
    let keyring = Arc::new(KeyringIdentityProvider::new());
    let reviewer = TestSigner::new("reviewer").with_role("reviewer");
    reviewer.register(&keyring);
    let (publisher, mut capa_events) = ChannelCapaPublisher::new();

    let orch = build_orchestrator(config, keyring, Arc::new(publisher)).await?;
    let sop = orch.registry().publish(procedure()?)?;
    let run = orch.start(&sop.key(), OperatorId::new("analyst")).await?;
    println!("run {} started ({})", run.id, sop.key());

    orch.submit_result(
        &run.id,
        &StepId::new("prepare"),
        StepPayload::new()
            .with_operator("analyst")
            .with_reagent_lot("LOT-2024-117"),
        None,
    )
    .await?;
    report(orch.advance(&run.id).await?);

    orch.submit_result(
        &run.id,
        &StepId::new("review"),
        StepPayload::new().with_field("plate_layout", "standard-96"),
        None,
    )
    .await?;
    let pending = match orch.advance(&run.id).await? {
        StepOutcome::AwaitingSignature(pending) => pending,
        other => bail!("expected a signature request, got {other:?}"),
    };
    println!("step review awaiting '{}' signature", pending.meaning);
    let signature = orch
        .submit_signature(&run.id, &pending.id, &reviewer.approve(&pending))
        .await?;
    println!("signed by {} ({})", signature.signer, signature.content_hash.short());
    report(orch.advance(&run.id).await?);

    orch.submit_result(
        &run.id,
        &StepId::new("read"),
        StepPayload::new().with_control(ControlMeasurement::new("low", reading, 100.0, 2.0)),
        Some(ProvenanceTag::qualified("plate-reader-7", "sha256:4f2a")),
    )
    .await?;
    let outcome = orch.advance(&run.id).await?;
    let held = matches!(outcome, StepOutcome::Held { .. });
    report(outcome);

    if held {
        let snapshot = orch.snapshot(&run.id).await?;
        let capa_id = snapshot
            .hold
            .map(|h| h.capa_id)
            .context("held run carries no deviation")?;
        orch.deviations()
            .close(
                &capa_id,
                "Control re-assayed within limits; reader recalibrated",
                &Actor::new("qa-lead").with_role(config.deviations.closure_role.as_str()),
            )
            .await?;
        let resumed = orch.resolve_hold(&run.id, HoldResolution::DeviationClosed).await?;
        println!("hold resolved, run is {}", resumed.state);
        report(orch.advance(&run.id).await?);
    }

    // the background flusher may already have delivered some of these
    orch.deviations().flush_outbox().await;
    let mut published = 0;
    while let Ok(event) = capa_events.try_recv() {
        println!("capa {} -> {}", event.capa_id, event.state);
        published += 1;
    }
    info!(published, "CAPA events published");

    let valid = orch.verify(&run.id).await?;
    println!("audit chain valid: {valid}");

    if let Some(path) = export {
        let export = orch.export_run(&run.id).await?;
        labflow_ledger::write_export(path, &export)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        println!("exported {} events to {}", export.events.len(), path.display());
    }
    Ok(())
}

fn report(outcome: StepOutcome) {
    match outcome {
        StepOutcome::Completed { record, warnings } => {
            println!("step {} recorded", record.step_id);
            for warning in warnings {
                println!("  qc warning {} on {}", warning.rule, warning.level);
            }
        }
        StepOutcome::AwaitingSignature(pending) => {
            println!("awaiting signature {}", pending.id);
        }
        StepOutcome::Held {
            record,
            violations,
            capa,
        } => {
            println!("step {} recorded, run on hold (capa {})", record.step_id, capa.id);
            for violation in violations {
                let kind = if violation.is_rejection() { "rejection" } else { "warning" };
                println!("  qc {kind} {} on {}", violation.rule, violation.level);
            }
        }
        StepOutcome::RunCompleted { record, warnings } => {
            println!("step {} recorded, run completed", record.step_id);
            for warning in warnings {
                println!("  qc warning {} on {}", warning.rule, warning.level);
            }
        }
    }
}
