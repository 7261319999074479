//! Run orchestrator: the run state machine
//!
//! Every run lives in its own slot, a mutex around the run plus an abort
//! flag. A transition is computed on a copy of the run, its audit event is
//! appended, and only then is the copy installed. If the append fails the
//! run is left exactly as it was.
//!
//! ```text
//! CREATED ─▶ RUNNING ─▶ COMPLETED
//!               │ ▲
//!               ▼ │
//!              HOLD ─▶ REJECTED
//!
//! any non-terminal state ─▶ ABORTED
//! ```

use crate::config::OrchestratorConfig;
use crate::executor::{StepExecution, StepExecutor, StepFailure};
use crate::{EngineError, EngineResult, SopRegistry};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use labflow_deviation::DeviationManager;
use labflow_ledger::{AuditEvent, AuditLedger, RunExport, StreamId};
use labflow_qc::{QcError, QcService};
use labflow_signature::{PendingApproval, SignatureGate, SignerCredential, TransitionIntent};
use labflow_types::{
    CapaRecord, ControlSampleResult, DefinitionError, Digest, DeviationTrigger, HoldCause, HoldReason,
    OperatorId, PendingApprovalId, ProvenanceTag, QcRuleViolation, RunId, RunInstance, RunState,
    Signature, SopDefinition, SopKey, StepId, StepInputs, StepPayload, StepRecord, StepSpec,
    TransitionAction,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Result of one successful `advance`.
#[derive(Clone, Debug)]
pub enum StepOutcome {
    /// Step recorded; more steps remain.
    Completed {
        record: StepRecord,
        warnings: Vec<QcRuleViolation>,
    },
    /// Step needs a signature before it can be recorded.
    AwaitingSignature(PendingApproval),
    /// Step recorded, but QC rejected it and the run is now on hold.
    Held {
        record: StepRecord,
        violations: Vec<QcRuleViolation>,
        capa: CapaRecord,
    },
    /// Last step recorded and the run completed.
    RunCompleted {
        record: StepRecord,
        warnings: Vec<QcRuleViolation>,
    },
}

/// How a hold is lifted.
#[derive(Clone, Debug)]
pub enum HoldResolution {
    /// The hold's deviation record has been closed.
    DeviationClosed,
    /// An authorized signer overrides the hold.
    Override {
        credential: SignerCredential,
        justification: String,
    },
}

struct RunSlot {
    run: Mutex<RunInstance>,
    aborting: AtomicBool,
}

/// Clears the abort flag however `abort` exits.
struct AbortFlag<'a>(&'a AtomicBool);

impl Drop for AbortFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct RunOrchestrator {
    registry: Arc<SopRegistry>,
    ledger: Arc<AuditLedger>,
    gate: Arc<SignatureGate>,
    executor: StepExecutor,
    qc: Arc<QcService>,
    deviations: Arc<DeviationManager>,
    config: OrchestratorConfig,
    runs: DashMap<RunId, Arc<RunSlot>>,
}

impl RunOrchestrator {
    pub fn new(
        registry: Arc<SopRegistry>,
        ledger: Arc<AuditLedger>,
        gate: Arc<SignatureGate>,
        qc: Arc<QcService>,
        deviations: Arc<DeviationManager>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            ledger,
            executor: StepExecutor::new(gate.clone()),
            gate,
            qc,
            deviations,
            config,
            runs: DashMap::new(),
        }
    }

    // ── Accessors ──────────────────────────────────────────────────────

    pub fn registry(&self) -> &Arc<SopRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<AuditLedger> {
        &self.ledger
    }

    pub fn gate(&self) -> &Arc<SignatureGate> {
        &self.gate
    }

    pub fn qc(&self) -> &Arc<QcService> {
        &self.qc
    }

    pub fn deviations(&self) -> &Arc<DeviationManager> {
        &self.deviations
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn run_ids(&self) -> Vec<RunId> {
        self.runs.iter().map(|e| e.key().clone()).collect()
    }

    // ── Slots and commits ──────────────────────────────────────────────

    fn slot(&self, run_id: &RunId) -> EngineResult<Arc<RunSlot>> {
        self.runs
            .get(run_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| EngineError::RunNotFound(run_id.clone()))
    }

    /// Take the run lock for a regular transition.
    async fn lock<'a>(
        &self,
        slot: &'a RunSlot,
        run_id: &RunId,
    ) -> EngineResult<MutexGuard<'a, RunInstance>> {
        if slot.aborting.load(Ordering::SeqCst) {
            return Err(EngineError::AbortInProgress(run_id.clone()));
        }
        let guard = tokio::time::timeout(self.config.lock_timeout(), slot.run.lock())
            .await
            .map_err(|_| {
                if slot.aborting.load(Ordering::SeqCst) {
                    EngineError::AbortInProgress(run_id.clone())
                } else {
                    EngineError::ConcurrencyConflict(run_id.clone())
                }
            })?;
        if slot.aborting.load(Ordering::SeqCst) {
            return Err(EngineError::AbortInProgress(run_id.clone()));
        }
        if guard.frozen {
            return Err(EngineError::RunFrozen(run_id.clone()));
        }
        Ok(guard)
    }

    fn ensure_not_aborting(slot: &RunSlot, run_id: &RunId) -> EngineResult<()> {
        if slot.aborting.load(Ordering::SeqCst) {
            debug!(run_id = %run_id, "Abort requested, discarding uncommitted step");
            return Err(EngineError::AbortInProgress(run_id.clone()));
        }
        Ok(())
    }

    /// Audit `next` and install it over `current`. On failure `current` is
    /// untouched. Terminal states seal the run's stream.
    async fn commit(
        &self,
        current: &mut RunInstance,
        mut next: RunInstance,
        event_type: &str,
        detail: serde_json::Value,
    ) -> EngineResult<AuditEvent> {
        next.touch();
        let stream = StreamId::run(&next.id);
        let payload = json!({
            "state": next.state,
            "version": next.version,
            "detail": detail,
        });

        let appended = if next.is_terminal() {
            self.ledger.append_sealing(&stream, event_type, payload).await
        } else {
            self.ledger.append(&stream, event_type, payload).await
        };

        match appended {
            Ok(event) => {
                *current = next;
                Ok(event)
            }
            Err(source) => {
                error!(
                    run_id = %current.id,
                    event_type,
                    error = %source,
                    "Transition rolled back, audit write failed"
                );
                Err(EngineError::AuditWriteFailed {
                    run_id: current.id.clone(),
                    source,
                })
            }
        }
    }

    fn freeze(run: &mut RunInstance, reason: &str) {
        run.frozen = true;
        run.touch();
        error!(run_id = %run.id, reason, "Run frozen");
    }

    fn definition(&self, run: &RunInstance) -> EngineResult<Arc<SopDefinition>> {
        self.registry.get(&run.sop)
    }

    fn step_spec(sop: &SopDefinition, run: &RunInstance, step_id: &StepId) -> EngineResult<StepSpec> {
        sop.step(step_id)
            .cloned()
            .ok_or_else(|| EngineError::StepNotFound {
                run_id: run.id.clone(),
                step_id: step_id.clone(),
            })
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Create a run of a published definition and start it.
    ///
    /// Only published definitions are in the registry, so an unknown key is
    /// reported as an unpublished definition.
    pub async fn start(&self, sop: &SopKey, operator: OperatorId) -> EngineResult<RunInstance> {
        let definition = self.registry.get(sop).map_err(|err| match err {
            EngineError::SopNotFound(key) => DefinitionError::Unpublished(key).into(),
            other => other,
        })?;
        definition.ensure_runnable()?;

        let mut run = RunInstance::new(sop.clone(), operator.clone());
        let created = run.clone();
        self.commit(
            &mut run,
            created,
            "run_created",
            json!({ "sop": sop, "operator": operator, "steps": definition.steps.len() }),
        )
        .await?;

        let mut started = run.clone();
        started.set_state(RunState::Running);
        started.step_started_at = Utc::now();
        let result = self.commit(&mut run, started, "run_started", json!({})).await;

        self.runs.insert(
            run.id.clone(),
            Arc::new(RunSlot {
                run: Mutex::new(run.clone()),
                aborting: AtomicBool::new(false),
            }),
        );
        result?;

        info!(run_id = %run.id, sop = %sop, operator = %operator, "Run started");
        Ok(run)
    }

    /// Execute the run's next step.
    pub async fn advance(&self, run_id: &RunId) -> EngineResult<StepOutcome> {
        let slot = self.slot(run_id)?;
        let mut run = self.lock(&slot, run_id).await?;
        if run.state != RunState::Running {
            return Err(EngineError::RunNotRunning {
                run_id: run_id.clone(),
                state: run.state,
            });
        }

        let sop = self.definition(&run)?;
        let Some(spec) = sop.steps.get(run.next_step).cloned() else {
            // every step recorded, e.g. after a hold on the last step was lifted
            let record = run.records.last().cloned().ok_or_else(|| EngineError::InvalidInput {
                run_id: run_id.clone(),
                step_id: None,
                reason: "definition has no steps".into(),
            })?;
            self.complete(&mut run).await?;
            return Ok(StepOutcome::RunCompleted {
                record,
                warnings: Vec::new(),
            });
        };

        let now = Utc::now();
        match self.executor.execute(&run, &spec, now).await? {
            StepExecution::AwaitingSignature(pending) => Ok(StepOutcome::AwaitingSignature(pending)),
            StepExecution::NeedsSignature { content_hash } => {
                // the request is audited, so nothing may be issued once an abort is queued
                Self::ensure_not_aborting(&slot, run_id)?;
                let pending = self.executor.request(&run, &spec, content_hash).await?;
                self.note_pending(&mut run, &spec.id, &pending).await?;
                Ok(StepOutcome::AwaitingSignature(pending))
            }
            StepExecution::Completed(record) => {
                Self::ensure_not_aborting(&slot, run_id)?;
                self.record_step(&mut run, &sop, &spec, record, now).await
            }
            StepExecution::Failed { record, failure } => {
                Self::ensure_not_aborting(&slot, run_id)?;
                Err(self.fail_step(&mut run, &spec, record, failure, now).await)
            }
        }
    }

    async fn note_pending(
        &self,
        run: &mut RunInstance,
        step_id: &StepId,
        pending: &PendingApproval,
    ) -> EngineResult<()> {
        let mut next = run.clone();
        next.pending_signatures
            .insert(step_id.clone(), pending.id.clone());
        self.commit(
            run,
            next,
            "step_awaiting_signature",
            json!({ "step_id": step_id, "pending": pending.id, "content_hash": pending.content_hash }),
        )
        .await?;
        info!(run_id = %run.id, step = %step_id, pending = %pending.id, "Step awaiting signature");
        Ok(())
    }

    async fn record_step(
        &self,
        run: &mut RunInstance,
        sop: &SopDefinition,
        spec: &StepSpec,
        record: StepRecord,
        now: DateTime<Utc>,
    ) -> EngineResult<StepOutcome> {
        let mut next = run.clone();
        next.records.push(record.clone());
        next.next_step += 1;
        next.step_started_at = now;
        next.staged.remove(&spec.id);
        next.pending_signatures.remove(&spec.id);
        self.commit(run, next, "step_completed", json!({ "record": record }))
            .await?;
        info!(
            run_id = %run.id,
            step = %spec.id,
            signed = record.signature.is_some(),
            content = %record.content_hash.short(),
            "Step recorded"
        );

        let violations = if spec.triggers_qc() {
            let results: Vec<ControlSampleResult> = record
                .inputs
                .payload
                .controls
                .iter()
                .map(|m| ControlSampleResult::from_measurement(run.id.clone(), m, record.recorded_at))
                .collect();
            match self.qc.record_all(results).await {
                Ok(violations) => violations,
                Err(err) => {
                    Self::freeze(run, "QC evaluation could not be recorded");
                    return Err(match err {
                        QcError::AuditWriteFailed(source) => EngineError::AuditWriteFailed {
                            run_id: run.id.clone(),
                            source,
                        },
                        source => EngineError::Qc {
                            run_id: run.id.clone(),
                            source,
                        },
                    });
                }
            }
        } else {
            Vec::new()
        };

        let rejections: Vec<&QcRuleViolation> =
            violations.iter().filter(|v| v.is_rejection()).collect();
        if let Some(primary) = rejections.iter().min_by_key(|v| v.rule.priority()) {
            let ids: Vec<_> = rejections.iter().map(|v| v.id.clone()).collect();
            let trigger = DeviationTrigger::QcViolation {
                run_id: run.id.clone(),
                rule: primary.rule,
                violation_ids: ids.clone(),
            };
            let cause = HoldCause::QcRejection { violations: ids };
            let capa = match self.hold(run, trigger, cause, "run_held", json!({}), now).await {
                Ok(capa) => capa,
                Err(err) => {
                    // a rejected step must never be built on
                    Self::freeze(run, "QC hold could not be recorded");
                    return Err(err);
                }
            };
            return Ok(StepOutcome::Held {
                record,
                violations,
                capa,
            });
        }

        if run.next_step >= sop.steps.len() {
            self.complete(run).await?;
            return Ok(StepOutcome::RunCompleted {
                record,
                warnings: violations,
            });
        }
        Ok(StepOutcome::Completed {
            record,
            warnings: violations,
        })
    }

    /// Record a failed step, open its deviation and put the run on hold.
    /// Returns the error the caller reports.
    async fn fail_step(
        &self,
        run: &mut RunInstance,
        spec: &StepSpec,
        record: StepRecord,
        failure: StepFailure,
        now: DateTime<Utc>,
    ) -> EngineError {
        let (trigger, cause) = match &failure {
            StepFailure::ApprovalTimeout { .. } => (
                DeviationTrigger::ApprovalTimeout {
                    run_id: run.id.clone(),
                    step_id: spec.id.clone(),
                },
                HoldCause::ApprovalTimeout {
                    step_id: spec.id.clone(),
                },
            ),
            other => (
                DeviationTrigger::StepFailure {
                    run_id: run.id.clone(),
                    step_id: spec.id.clone(),
                    reason: other.to_string(),
                },
                HoldCause::StepFailure {
                    step_id: spec.id.clone(),
                    reason: other.to_string(),
                },
            ),
        };

        let mut failed = run.clone();
        failed.records.push(record.clone());
        if matches!(failure, StepFailure::ApprovalTimeout { .. }) {
            failed.pending_signatures.remove(&spec.id);
        }
        let capa = match self
            .hold_from(run, failed, trigger, cause, "step_failed", json!({ "record": record }), now)
            .await
        {
            Ok(capa) => capa,
            Err(err) => return err,
        };

        warn!(run_id = %run.id, step = %spec.id, capa = %capa.id, reason = %failure, "Step failed, run on hold");
        match failure {
            StepFailure::ApprovalTimeout { .. } => EngineError::ApprovalTimeout {
                run_id: run.id.clone(),
                step_id: spec.id.clone(),
                capa_id: capa.id,
            },
            other => EngineError::StepExecutionFailed {
                run_id: run.id.clone(),
                step_id: spec.id.clone(),
                reason: other.to_string(),
                capa_id: capa.id,
            },
        }
    }

    async fn hold(
        &self,
        run: &mut RunInstance,
        trigger: DeviationTrigger,
        cause: HoldCause,
        event_type: &str,
        detail: serde_json::Value,
        now: DateTime<Utc>,
    ) -> EngineResult<CapaRecord> {
        let base = run.clone();
        self.hold_from(run, base, trigger, cause, event_type, detail, now)
            .await
    }

    /// Commit `base` moved to HOLD, then open the deviation it names.
    ///
    /// The run's transition goes first so a failed hold leaves no deviation
    /// behind. If the deviation cannot be opened after the hold is recorded,
    /// the run is frozen.
    #[allow(clippy::too_many_arguments)]
    async fn hold_from(
        &self,
        run: &mut RunInstance,
        base: RunInstance,
        trigger: DeviationTrigger,
        cause: HoldCause,
        event_type: &str,
        detail: serde_json::Value,
        now: DateTime<Utc>,
    ) -> EngineResult<CapaRecord> {
        let capa = CapaRecord::open(trigger);

        let mut next = base;
        next.set_state(RunState::Hold);
        let hold = HoldReason {
            cause,
            capa_id: capa.id.clone(),
            since: now,
        };
        next.hold = Some(hold.clone());
        self.commit(
            run,
            next,
            event_type,
            json!({ "hold": hold, "detail": detail }),
        )
        .await?;

        if let Err(source) = self.deviations.open_record(capa.clone()).await {
            Self::freeze(run, "deviation for hold could not be recorded");
            return Err(EngineError::Deviation {
                run_id: Some(run.id.clone()),
                source,
            });
        }

        warn!(run_id = %run.id, capa = %capa.id, "Run on hold");
        Ok(capa)
    }

    async fn complete(&self, run: &mut RunInstance) -> EngineResult<()> {
        let mut next = run.clone();
        next.set_state(RunState::Completed);
        let steps = next.successful_steps();
        self.commit(run, next, "run_completed", json!({ "steps": steps }))
            .await?;
        self.gate.release_run(&run.id).await;
        info!(run_id = %run.id, steps, "Run completed");
        Ok(())
    }

    /// Lift a hold once its deviation is closed, or on an authorized override.
    ///
    /// The run returns to RUNNING. If the held step was the last one, the
    /// next `advance` completes the run.
    pub async fn resolve_hold(
        &self,
        run_id: &RunId,
        resolution: HoldResolution,
    ) -> EngineResult<RunInstance> {
        let slot = self.slot(run_id)?;
        let mut run = self.lock(&slot, run_id).await?;
        if run.state != RunState::Hold {
            return Err(EngineError::RunNotHeld {
                run_id: run_id.clone(),
                state: run.state,
            });
        }
        let hold = run.hold.clone().ok_or_else(|| EngineError::UnresolvedDeviation {
            run_id: run_id.clone(),
            reason: "hold has no recorded cause".into(),
        })?;

        let detail = match resolution {
            HoldResolution::DeviationClosed => {
                let capa = self.deviations.get(&hold.capa_id).await.ok_or_else(|| {
                    EngineError::UnresolvedDeviation {
                        run_id: run_id.clone(),
                        reason: format!("deviation {} not found", hold.capa_id),
                    }
                })?;
                if !capa.is_closed() {
                    return Err(EngineError::UnresolvedDeviation {
                        run_id: run_id.clone(),
                        reason: format!("deviation {} is {}", capa.id, capa.state),
                    });
                }
                json!({ "resolution": "deviation_closed", "capa_id": capa.id })
            }
            HoldResolution::Override {
                credential,
                justification,
            } => {
                if justification.trim().is_empty() {
                    return Err(EngineError::UnresolvedDeviation {
                        run_id: run_id.clone(),
                        reason: "override requires a justification".into(),
                    });
                }
                let intent = transition_intent_for(&run, TransitionAction::Override, &justification)?;
                let signed = self
                    .gate
                    .sign_transition(&intent, &credential)
                    .await
                    .map_err(|source| EngineError::Signature {
                        run_id: run_id.clone(),
                        step_id: None,
                        source,
                    })?;
                if !signed.roles.contains(&self.config.override_role) {
                    warn!(run_id = %run_id, signer = %signed.signature.signer, "Override refused: missing role");
                    return Err(EngineError::UnresolvedDeviation {
                        run_id: run_id.clone(),
                        reason: format!(
                            "{} lacks role {}",
                            signed.signature.signer, self.config.override_role
                        ),
                    });
                }
                json!({
                    "resolution": "override",
                    "capa_id": hold.capa_id,
                    "justification": justification,
                    "signature": signed.signature,
                })
            }
        };

        let mut next = run.clone();
        next.set_state(RunState::Running);
        next.step_started_at = Utc::now();
        self.commit(&mut run, next, "run_resumed", detail).await?;
        info!(run_id = %run_id, capa = %hold.capa_id, "Hold resolved");
        Ok(run.clone())
    }

    /// Abort a run from any non-terminal state.
    ///
    /// Raises the abort flag first so that queued and in-flight transitions
    /// back off, then waits for the run lock without a timeout.
    pub async fn abort(
        &self,
        run_id: &RunId,
        reason: &str,
        credential: &SignerCredential,
    ) -> EngineResult<RunInstance> {
        if reason.trim().is_empty() {
            return Err(EngineError::InvalidInput {
                run_id: run_id.clone(),
                step_id: None,
                reason: "abort requires a reason".into(),
            });
        }
        let slot = self.slot(run_id)?;
        if slot.aborting.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AbortInProgress(run_id.clone()));
        }
        let _flag = AbortFlag(&slot.aborting);

        let mut run = slot.run.lock().await;
        if run.is_terminal() {
            return Err(EngineError::RunTerminal {
                run_id: run_id.clone(),
                state: run.state,
            });
        }
        if run.frozen {
            return Err(EngineError::RunFrozen(run_id.clone()));
        }

        let signature = self
            .sign(&run, TransitionAction::Abort, reason, credential)
            .await?;
        let from = run.state;
        let mut next = run.clone();
        next.set_state(RunState::Aborted);
        next.staged.clear();
        next.pending_signatures.clear();
        self.commit(
            &mut run,
            next,
            "run_aborted",
            json!({ "from": from, "reason": reason, "signature": signature }),
        )
        .await?;

        let released = self.gate.release_run(run_id).await;
        warn!(run_id = %run_id, from = %from, signer = %signature.signer, released, "Run aborted");
        Ok(run.clone())
    }

    /// Abandon a held run.
    pub async fn reject(
        &self,
        run_id: &RunId,
        reason: &str,
        credential: &SignerCredential,
    ) -> EngineResult<RunInstance> {
        if reason.trim().is_empty() {
            return Err(EngineError::InvalidInput {
                run_id: run_id.clone(),
                step_id: None,
                reason: "reject requires a reason".into(),
            });
        }
        let slot = self.slot(run_id)?;
        let mut run = self.lock(&slot, run_id).await?;
        if run.state != RunState::Hold {
            return Err(EngineError::RunNotHeld {
                run_id: run_id.clone(),
                state: run.state,
            });
        }

        let signature = self
            .sign(&run, TransitionAction::Reject, reason, credential)
            .await?;
        let capa_id = run.hold.as_ref().map(|h| h.capa_id.clone());
        let mut next = run.clone();
        next.set_state(RunState::Rejected);
        next.staged.clear();
        next.pending_signatures.clear();
        self.commit(
            &mut run,
            next,
            "run_rejected",
            json!({ "reason": reason, "capa_id": capa_id, "signature": signature }),
        )
        .await?;

        self.gate.release_run(run_id).await;
        warn!(run_id = %run_id, signer = %signature.signer, "Run rejected");
        Ok(run.clone())
    }

    async fn sign(
        &self,
        run: &RunInstance,
        action: TransitionAction,
        statement: &str,
        credential: &SignerCredential,
    ) -> EngineResult<Signature> {
        let intent = transition_intent_for(run, action, statement)?;
        let signed = self
            .gate
            .sign_transition(&intent, credential)
            .await
            .map_err(|source| EngineError::Signature {
                run_id: run.id.clone(),
                step_id: None,
                source,
            })?;
        Ok(signed.signature)
    }

    /// The intent a signer must sign to authorize `action` with `statement`
    /// (the abort or reject reason, or the override justification).
    pub async fn transition_intent(
        &self,
        run_id: &RunId,
        action: TransitionAction,
        statement: &str,
    ) -> EngineResult<TransitionIntent> {
        let run = self.snapshot(run_id).await?;
        transition_intent_for(&run, action, statement)
    }

    // ── Inputs and signatures ──────────────────────────────────────────

    /// Stage inputs for a step. Returns the content hash a signature over
    /// the step will bind to.
    pub async fn submit_result(
        &self,
        run_id: &RunId,
        step_id: &StepId,
        payload: StepPayload,
        provenance: Option<ProvenanceTag>,
    ) -> EngineResult<Digest> {
        let slot = self.slot(run_id)?;
        let mut run = self.lock(&slot, run_id).await?;
        match run.state {
            RunState::Running | RunState::Hold => {}
            state if state.is_terminal() => {
                return Err(EngineError::RunTerminal {
                    run_id: run_id.clone(),
                    state,
                })
            }
            state => {
                return Err(EngineError::RunNotRunning {
                    run_id: run_id.clone(),
                    state,
                })
            }
        }

        let sop = self.definition(&run)?;
        Self::step_spec(&sop, &run, step_id)?;
        let invalid = |reason: String| EngineError::InvalidInput {
            run_id: run_id.clone(),
            step_id: Some(step_id.clone()),
            reason,
        };
        if run.completed_record(step_id).is_some() {
            return Err(invalid("step is already recorded".into()));
        }
        if let Some(bad) = payload.controls.iter().find(|c| !c.is_well_formed()) {
            return Err(invalid(format!("control {} is malformed", bad.level)));
        }
        let replacing = run.staged.contains_key(step_id);
        let has_reason = payload
            .reason_for_change
            .as_deref()
            .is_some_and(|r| !r.trim().is_empty());
        if replacing && self.config.require_reason_for_changes && !has_reason {
            return Err(invalid("replacing a submission requires a reason for change".into()));
        }

        let submitted_by = payload.operator.clone().unwrap_or_else(|| run.operator.clone());
        let inputs = StepInputs::new(payload, provenance, submitted_by);
        let content_hash = inputs.content_hash(run_id, step_id)?;

        let mut next = run.clone();
        next.staged.insert(step_id.clone(), inputs.clone());
        self.commit(
            &mut run,
            next,
            "step_input_submitted",
            json!({
                "step_id": step_id,
                "inputs": inputs,
                "content_hash": content_hash,
                "replaces_previous": replacing,
            }),
        )
        .await?;

        info!(run_id = %run_id, step = %step_id, content = %content_hash.short(), replacing, "Step input submitted");
        Ok(content_hash)
    }

    /// Open (or return the open) signature request for a step.
    pub async fn request_signature(
        &self,
        run_id: &RunId,
        step_id: &StepId,
    ) -> EngineResult<PendingApproval> {
        let slot = self.slot(run_id)?;
        let mut run = self.lock(&slot, run_id).await?;
        if run.state != RunState::Running {
            return Err(EngineError::RunNotRunning {
                run_id: run_id.clone(),
                state: run.state,
            });
        }
        let sop = self.definition(&run)?;
        let spec = Self::step_spec(&sop, &run, step_id)?;
        if !spec.requires_signature {
            return Err(EngineError::InvalidInput {
                run_id: run_id.clone(),
                step_id: Some(step_id.clone()),
                reason: "step does not require a signature".into(),
            });
        }

        let content_hash = StepExecutor::content_hash(&run, step_id)?;
        if let Some(pending) = run
            .pending_signatures
            .get(step_id)
            .and_then(|id| self.gate.pending(id))
        {
            let open = matches!(
                self.gate.status(&pending.id).await,
                Some(labflow_signature::ApprovalStatus::Pending)
            );
            if open && !pending.is_expired_at(Utc::now()) && pending.content_hash == content_hash {
                return Ok(pending);
            }
        }

        let pending = self.executor.request(&run, &spec, content_hash).await?;
        self.note_pending(&mut run, step_id, &pending).await?;
        Ok(pending)
    }

    /// Sign an open request against the step's current content.
    pub async fn submit_signature(
        &self,
        run_id: &RunId,
        pending_id: &PendingApprovalId,
        credential: &SignerCredential,
    ) -> EngineResult<Signature> {
        let slot = self.slot(run_id)?;
        let run = self.lock(&slot, run_id).await?;
        if run.is_terminal() {
            return Err(EngineError::RunTerminal {
                run_id: run_id.clone(),
                state: run.state,
            });
        }
        let signature_error = |source| EngineError::Signature {
            run_id: run_id.clone(),
            step_id: None,
            source,
        };
        let pending = self.gate.pending(pending_id).ok_or_else(|| {
            signature_error(labflow_signature::SignatureError::PendingApprovalNotFound(
                pending_id.clone(),
            ))
        })?;
        let step_id = match pending.target.step_id() {
            Some(step_id) if pending.target.run_id() == run_id => step_id.clone(),
            _ => {
                return Err(EngineError::InvalidInput {
                    run_id: run_id.clone(),
                    step_id: None,
                    reason: format!("approval {pending_id} is not a step approval of this run"),
                })
            }
        };

        let content_hash = StepExecutor::content_hash(&run, &step_id)?;
        self.gate
            .submit(pending_id, credential, &content_hash)
            .await
            .map_err(|source| EngineError::Signature {
                run_id: run_id.clone(),
                step_id: Some(step_id),
                source,
            })
    }

    // ── Integrity, timeouts, export ────────────────────────────────────

    /// Re-verify the run's audit chain. A broken chain freezes the run.
    pub async fn verify(&self, run_id: &RunId) -> EngineResult<bool> {
        let slot = self.slot(run_id)?;
        let report = self
            .ledger
            .verify_report(&StreamId::run(run_id))
            .await
            .map_err(|source| EngineError::AuditReadFailed {
                run_id: run_id.clone(),
                source,
            })?;
        if report.is_valid() {
            debug!(run_id = %run_id, events = report.total_events, "Audit chain verified");
            return Ok(true);
        }

        let mut run = slot.run.lock().await;
        error!(
            run_id = %run_id,
            first_invalid = ?report.first_invalid_seq,
            fault = ?report.fault,
            "Audit chain verification failed"
        );
        if !run.frozen {
            Self::freeze(&mut run, "audit chain verification failed");
        }
        Ok(false)
    }

    /// Expire overdue signature requests and put their runs on hold.
    /// Returns the runs that were held.
    pub async fn expire_approvals(&self, now: DateTime<Utc>) -> Vec<RunId> {
        let mut held = Vec::new();
        for pending in self.gate.expire_due(now).await {
            let Some(step_id) = pending.target.step_id().cloned() else {
                continue;
            };
            let run_id = pending.target.run_id().clone();
            match self.hold_for_timeout(&run_id, &step_id, &pending, now).await {
                Ok(true) => held.push(run_id),
                Ok(false) => {}
                Err(err) => {
                    warn!(run_id = %run_id, pending = %pending.id, error = %err, "Could not hold run for expired approval")
                }
            }
        }
        held
    }

    async fn hold_for_timeout(
        &self,
        run_id: &RunId,
        step_id: &StepId,
        pending: &PendingApproval,
        now: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let slot = self.slot(run_id)?;
        let mut run = self.lock(&slot, run_id).await?;
        if run.state != RunState::Running || run.pending_signatures.get(step_id) != Some(&pending.id)
        {
            return Ok(false);
        }
        let sop = self.definition(&run)?;
        let spec = Self::step_spec(&sop, &run, step_id)?;

        let inputs = StepExecutor::inputs_for(&run, step_id);
        let content_hash = inputs.content_hash(run_id, step_id)?;
        let failure = StepFailure::ApprovalTimeout {
            pending: pending.id.clone(),
        };
        let record = StepExecutor::failed_record(&run, &spec, inputs, content_hash, &failure, now);
        match self.fail_step(&mut run, &spec, record, failure, now).await {
            EngineError::ApprovalTimeout { .. } => Ok(true),
            other => Err(other),
        }
    }

    /// Periodically sweep expired signature requests.
    pub fn spawn_approval_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let held = orchestrator.expire_approvals(Utc::now()).await;
                if !held.is_empty() {
                    info!(runs = held.len(), "Runs held for expired approvals");
                }
            }
        })
    }

    /// Stop tracking a terminal run and return its final state.
    ///
    /// Terminal runs stay in memory for `snapshot` and `export_run` until
    /// released; their audit streams are unaffected.
    pub async fn release(&self, run_id: &RunId) -> EngineResult<RunInstance> {
        let slot = self.slot(run_id)?;
        let run = slot.run.lock().await;
        if !run.is_terminal() {
            return Err(EngineError::InvalidInput {
                run_id: run_id.clone(),
                step_id: None,
                reason: format!("run is {} and cannot be released", run.state),
            });
        }
        let last = run.clone();
        drop(run);
        self.runs.remove(run_id);
        debug!(run_id = %run_id, state = %last.state, "Run released");
        Ok(last)
    }

    pub async fn snapshot(&self, run_id: &RunId) -> EngineResult<RunInstance> {
        let slot = self.slot(run_id)?;
        let run = slot.run.lock().await;
        Ok(run.clone())
    }

    /// The run together with its full audit stream.
    pub async fn export_run(&self, run_id: &RunId) -> EngineResult<RunExport> {
        let run = self.snapshot(run_id).await?;
        let events = self
            .ledger
            .events(&StreamId::run(run_id))
            .await
            .map_err(|source| EngineError::AuditReadFailed {
                run_id: run_id.clone(),
                source,
            })?;
        Ok(RunExport::new(run, events))
    }
}

/// Transition signatures bind the run, the action, the stated reason and,
/// for reject and override, the deviation behind the hold.
fn transition_intent_for(
    run: &RunInstance,
    action: TransitionAction,
    statement: &str,
) -> EngineResult<TransitionIntent> {
    let capa_id = match action {
        TransitionAction::Abort => None,
        TransitionAction::Reject | TransitionAction::Override => {
            run.hold.as_ref().map(|h| h.capa_id.clone())
        }
    };
    let content_hash = Digest::of_json(
        "labflow-transition-content-v1",
        &(&run.id, action, statement, capa_id),
    )?;
    Ok(TransitionIntent::new(run.id.clone(), action, content_hash))
}
