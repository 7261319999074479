//! Step execution: input checks and signature requirements for one step
//!
//! The executor never mutates a run. It looks at the run as it is, decides
//! what the current step's outcome would be, and hands that back to the
//! orchestrator, which commits it (or discards it) under the run lock.

use crate::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use labflow_signature::{ApprovalStatus, PendingApproval, SignatureGate};
use labflow_types::{
    ControlLevelId, Digest, InstrumentId, PendingApprovalId, QualificationStatus, RunInstance,
    Signature, SignatureTarget, StepId, StepInputs, StepPayload, StepRecord, StepRecordId,
    StepSpec, StepStatus,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Why a step could not be recorded as successful.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum StepFailure {
    #[error("missing required inputs: {}", .0.join(", "))]
    MissingInputs(Vec<String>),

    #[error("instrument {instrument} is not qualified ({status:?})")]
    InstrumentNotQualified {
        instrument: InstrumentId,
        status: QualificationStatus,
    },

    #[error("step recorded after {elapsed_secs}s, minimum is {required_secs}s")]
    MinimumDuration { required_secs: u64, elapsed_secs: i64 },

    #[error("control levels do not match: missing {missing:?}, unexpected {unexpected:?}")]
    ControlLevels {
        missing: Vec<ControlLevelId>,
        unexpected: Vec<ControlLevelId>,
    },

    #[error("signature request {pending} expired unsigned")]
    ApprovalTimeout { pending: PendingApprovalId },
}

/// What executing the current step would do.
#[derive(Clone, Debug)]
pub enum StepExecution {
    /// Every check passed; the record is ready to commit.
    Completed(StepRecord),
    /// An earlier signature request over the same content is still open.
    AwaitingSignature(PendingApproval),
    /// The step needs a signature and no open request covers its content.
    /// Nothing has been requested yet; the caller issues it with
    /// [`StepExecutor::request`].
    NeedsSignature { content_hash: Digest },
    /// A check failed; the failure record is ready to commit.
    Failed {
        record: StepRecord,
        failure: StepFailure,
    },
}

pub struct StepExecutor {
    gate: Arc<SignatureGate>,
}

impl StepExecutor {
    pub fn new(gate: Arc<SignatureGate>) -> Self {
        Self { gate }
    }

    /// Inputs staged for a step, or an empty submission by the run's
    /// operator. The fallback is deterministic so its content hash is stable.
    pub fn inputs_for(run: &RunInstance, step_id: &StepId) -> StepInputs {
        run.staged.get(step_id).cloned().unwrap_or_else(|| StepInputs {
            payload: StepPayload::new(),
            provenance: None,
            submitted_by: run.operator.clone(),
            submitted_at: run.step_started_at,
        })
    }

    pub fn content_hash(run: &RunInstance, step_id: &StepId) -> EngineResult<Digest> {
        Ok(Self::inputs_for(run, step_id).content_hash(&run.id, step_id)?)
    }

    pub async fn execute(
        &self,
        run: &RunInstance,
        spec: &StepSpec,
        now: DateTime<Utc>,
    ) -> EngineResult<StepExecution> {
        let inputs = Self::inputs_for(run, &spec.id);
        let content_hash = inputs.content_hash(&run.id, &spec.id)?;

        if let Some(failure) = check_inputs(run, spec, &inputs, now) {
            debug!(run_id = %run.id, step = %spec.id, reason = %failure, "Step checks failed");
            let record = Self::failed_record(run, spec, inputs, content_hash, &failure, now);
            return Ok(StepExecution::Failed { record, failure });
        }

        if !spec.requires_signature {
            let record = completed_record(run, spec, inputs, content_hash, None, now);
            return Ok(StepExecution::Completed(record));
        }

        if let Some(pending_id) = run.pending_signatures.get(&spec.id) {
            match self.gate.status(pending_id).await {
                Some(ApprovalStatus::Signed { signature }) if signature.binds(&content_hash) => {
                    let record =
                        completed_record(run, spec, inputs, content_hash, Some(signature), now);
                    return Ok(StepExecution::Completed(record));
                }
                Some(ApprovalStatus::Expired) => {
                    let failure = StepFailure::ApprovalTimeout {
                        pending: pending_id.clone(),
                    };
                    let record = Self::failed_record(run, spec, inputs, content_hash, &failure, now);
                    return Ok(StepExecution::Failed { record, failure });
                }
                Some(ApprovalStatus::Pending) => {
                    if let Some(pending) = self.gate.pending(pending_id) {
                        if pending.is_expired_at(now) {
                            let failure = StepFailure::ApprovalTimeout {
                                pending: pending_id.clone(),
                            };
                            let record =
                                Self::failed_record(run, spec, inputs, content_hash, &failure, now);
                            return Ok(StepExecution::Failed { record, failure });
                        }
                        if pending.content_hash == content_hash {
                            return Ok(StepExecution::AwaitingSignature(pending));
                        }
                    }
                }
                // signed over older content, withdrawn, or unknown
                _ => {}
            }
        }

        Ok(StepExecution::NeedsSignature { content_hash })
    }

    /// Open a new signature request for the step's current content.
    pub async fn request(
        &self,
        run: &RunInstance,
        spec: &StepSpec,
        content_hash: Digest,
    ) -> EngineResult<PendingApproval> {
        let meaning = spec.signature_meaning.ok_or_else(|| {
            EngineError::InvalidDefinition(labflow_types::DefinitionError::MissingSignatureMeaning(
                spec.id.clone(),
            ))
        })?;
        let target = SignatureTarget::Step {
            run_id: run.id.clone(),
            step_id: spec.id.clone(),
        };
        self.gate
            .request_signature(target, meaning, content_hash)
            .await
            .map_err(|source| EngineError::Signature {
                run_id: run.id.clone(),
                step_id: Some(spec.id.clone()),
                source,
            })
    }

    pub fn failed_record(
        run: &RunInstance,
        spec: &StepSpec,
        inputs: StepInputs,
        content_hash: Digest,
        failure: &StepFailure,
        now: DateTime<Utc>,
    ) -> StepRecord {
        StepRecord {
            id: StepRecordId::generate(),
            run_id: run.id.clone(),
            step_id: spec.id.clone(),
            inputs,
            status: StepStatus::Failure,
            failure_reason: Some(failure.to_string()),
            recorded_at: now,
            content_hash,
            signature: None,
        }
    }
}

fn completed_record(
    run: &RunInstance,
    spec: &StepSpec,
    inputs: StepInputs,
    content_hash: Digest,
    signature: Option<Signature>,
    now: DateTime<Utc>,
) -> StepRecord {
    StepRecord {
        id: StepRecordId::generate(),
        run_id: run.id.clone(),
        step_id: spec.id.clone(),
        inputs,
        status: StepStatus::Success,
        failure_reason: None,
        recorded_at: now,
        content_hash,
        signature,
    }
}

fn check_inputs(
    run: &RunInstance,
    spec: &StepSpec,
    inputs: &StepInputs,
    now: DateTime<Utc>,
) -> Option<StepFailure> {
    let missing: Vec<String> = spec
        .required_inputs
        .iter()
        .filter(|name| match name.as_str() {
            "instrument" => inputs.provenance.is_none(),
            other => !inputs.payload.has_input(other),
        })
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Some(StepFailure::MissingInputs(missing));
    }

    if let Some(provenance) = &inputs.provenance {
        if provenance.qualification != QualificationStatus::Qualified {
            return Some(StepFailure::InstrumentNotQualified {
                instrument: provenance.instrument_id.clone(),
                status: provenance.qualification,
            });
        }
    }

    if let Some(levels) = &spec.qc_levels {
        let expected: BTreeSet<&ControlLevelId> = levels.iter().collect();
        let reported: BTreeSet<&ControlLevelId> =
            inputs.payload.controls.iter().map(|c| &c.level).collect();
        let missing: Vec<ControlLevelId> = expected
            .difference(&reported)
            .map(|l| (*l).clone())
            .collect();
        let unexpected: Vec<ControlLevelId> = reported
            .difference(&expected)
            .map(|l| (*l).clone())
            .collect();
        if !missing.is_empty() || !unexpected.is_empty() {
            return Some(StepFailure::ControlLevels {
                missing,
                unexpected,
            });
        }
    }

    if let Some(required_secs) = spec.min_duration_secs {
        let elapsed_secs = (now - run.step_started_at).num_seconds();
        if elapsed_secs < required_secs as i64 {
            return Some(StepFailure::MinimumDuration {
                required_secs,
                elapsed_secs,
            });
        }
    }

    None
}
