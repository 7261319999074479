//! Run instances and step records

use crate::{
    CapaId, Digest, OperatorId, PendingApprovalId, ProvenanceTag, RunId, Signature, SopKey,
    StepId, StepPayload, StepRecordId, ViolationId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Run lifecycle.
///
/// ```text
/// CREATED → RUNNING → COMPLETED | ABORTED
///           RUNNING ⇄ HOLD → REJECTED
/// ```
/// Abort is reachable from every non-terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Created,
    Running,
    Hold,
    Completed,
    Aborted,
    Rejected,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Aborted | RunState::Rejected
        )
    }

    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Created, Running) => true,
            (Running, Completed) | (Running, Hold) => true,
            (Hold, Running) | (Hold, Rejected) => true,
            (from, Aborted) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Created => "CREATED",
            RunState::Running => "RUNNING",
            RunState::Hold => "HOLD",
            RunState::Completed => "COMPLETED",
            RunState::Aborted => "ABORTED",
            RunState::Rejected => "REJECTED",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run is on hold.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HoldCause {
    QcRejection { violations: Vec<ViolationId> },
    StepFailure { step_id: StepId, reason: String },
    ApprovalTimeout { step_id: StepId },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldReason {
    pub cause: HoldCause,
    /// The deviation opened for this hold
    pub capa_id: CapaId,
    pub since: DateTime<Utc>,
}

/// Inputs captured for a step, as staged through the ingestion boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepInputs {
    pub payload: StepPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<ProvenanceTag>,
    pub submitted_by: OperatorId,
    pub submitted_at: DateTime<Utc>,
}

impl StepInputs {
    pub fn new(payload: StepPayload, provenance: Option<ProvenanceTag>, submitted_by: OperatorId) -> Self {
        Self {
            payload,
            provenance,
            submitted_by,
            submitted_at: Utc::now(),
        }
    }

    /// Hash of the content a step signature binds to.
    pub fn content_hash(&self, run_id: &RunId, step_id: &StepId) -> Result<Digest, serde_json::Error> {
        Digest::of_json("labflow-step-content-v1", &(run_id, step_id, self))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failure,
    Skipped,
}

/// The recorded result of executing one step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: StepRecordId,
    pub run_id: RunId,
    pub step_id: StepId,
    pub inputs: StepInputs,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub content_hash: Digest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
}

impl StepRecord {
    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }
}

/// One execution of a SOP definition.
///
/// Owned by the orchestrator while the run is live; read-only once terminal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunInstance {
    pub id: RunId,
    pub sop: SopKey,
    pub operator: OperatorId,
    pub state: RunState,
    pub records: Vec<StepRecord>,
    /// Index of the next step to execute
    pub next_step: usize,
    /// When the current step became current
    pub step_started_at: DateTime<Utc>,
    /// Inputs submitted for steps that are not yet recorded
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub staged: BTreeMap<StepId, StepInputs>,
    /// Open signature requests per step
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pending_signatures: BTreeMap<StepId, PendingApprovalId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold: Option<HoldReason>,
    /// Set when the audit chain failed verification; no further transitions
    #[serde(default)]
    pub frozen: bool,
    /// Bumped on every committed change
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunInstance {
    pub fn new(sop: SopKey, operator: OperatorId) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::generate(),
            sop,
            operator,
            state: RunState::Created,
            records: Vec::new(),
            next_step: 0,
            step_started_at: now,
            staged: BTreeMap::new(),
            pending_signatures: BTreeMap::new(),
            hold: None,
            frozen: false,
            version: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move to `next`, stamping timestamps. Callers check legality first.
    pub fn set_state(&mut self, next: RunState) {
        let now = Utc::now();
        self.state = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        if next != RunState::Hold {
            self.hold = None;
        }
    }

    pub fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }

    /// Successful record for a step, if any.
    pub fn completed_record(&self, step_id: &StepId) -> Option<&StepRecord> {
        self.records
            .iter()
            .find(|r| &r.step_id == step_id && r.is_success())
    }

    pub fn successful_steps(&self) -> usize {
        self.records.iter().filter(|r| r.is_success()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_edges() {
        use RunState::*;
        assert!(Created.can_transition_to(Running));
        assert!(Running.can_transition_to(Hold));
        assert!(Hold.can_transition_to(Running));
        assert!(Hold.can_transition_to(Rejected));
        assert!(Created.can_transition_to(Aborted));
        assert!(Hold.can_transition_to(Aborted));
        assert!(!Running.can_transition_to(Rejected));
        assert!(!Created.can_transition_to(Completed));
        for terminal in [Completed, Aborted, Rejected] {
            assert!(terminal.is_terminal());
            for next in [Created, Running, Hold, Completed, Aborted, Rejected] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn terminal_state_stamps_completion() {
        let mut run = RunInstance::new(SopKey::new("sop", 1), OperatorId::new("op"));
        run.set_state(RunState::Running);
        assert!(run.completed_at.is_none());
        run.set_state(RunState::Aborted);
        assert!(run.completed_at.is_some());
        assert!(run.is_terminal());
    }

    #[test]
    fn content_hash_tracks_payload() {
        let run_id = RunId::new("run");
        let step = StepId::new("s1");
        let inputs = StepInputs::new(
            StepPayload::new().with_reagent_lot("A"),
            None,
            OperatorId::new("op"),
        );
        let mut changed = inputs.clone();
        changed.payload.reagent_lot = Some("B".into());
        assert_eq!(
            inputs.content_hash(&run_id, &step).unwrap(),
            inputs.content_hash(&run_id, &step).unwrap()
        );
        assert_ne!(
            inputs.content_hash(&run_id, &step).unwrap(),
            changed.content_hash(&run_id, &step).unwrap()
        );
    }
}
