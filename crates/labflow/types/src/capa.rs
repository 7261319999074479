//! Deviation / CAPA records

use crate::{CapaId, OperatorId, Role, RunId, StepId, ViolationId, WestgardRule};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapaState {
    Open,
    Investigating,
    Closed,
}

impl CapaState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapaState::Open => "OPEN",
            CapaState::Investigating => "INVESTIGATING",
            CapaState::Closed => "CLOSED",
        }
    }
}

impl std::fmt::Display for CapaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a deviation to be opened.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviationTrigger {
    QcViolation {
        run_id: RunId,
        rule: WestgardRule,
        violation_ids: Vec<ViolationId>,
    },
    StepFailure {
        run_id: RunId,
        step_id: StepId,
        reason: String,
    },
    ApprovalTimeout {
        run_id: RunId,
        step_id: StepId,
    },
}

impl DeviationTrigger {
    pub fn run_id(&self) -> &RunId {
        match self {
            DeviationTrigger::QcViolation { run_id, .. }
            | DeviationTrigger::StepFailure { run_id, .. }
            | DeviationTrigger::ApprovalTimeout { run_id, .. } => run_id,
        }
    }
}

/// An authenticated person acting on the system, with their roles.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: OperatorId,
    #[serde(default)]
    pub roles: BTreeSet<Role>,
}

impl Actor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: OperatorId::new(id),
            roles: BTreeSet::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(Role::new(role));
        self
    }

    pub fn has_role(&self, role: &Role) -> bool {
        self.roles.contains(role)
    }
}

/// A corrective / preventive action record.
///
/// Lives independently of the run that spawned it and may outlive it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapaRecord {
    pub id: CapaId,
    pub trigger: DeviationTrigger,
    pub state: CapaState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<OperatorId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_by: Option<OperatorId>,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl CapaRecord {
    pub fn open(trigger: DeviationTrigger) -> Self {
        let now = Utc::now();
        Self {
            id: CapaId::generate(),
            trigger,
            state: CapaState::Open,
            owner: None,
            resolution_notes: None,
            closed_by: None,
            opened_at: now,
            updated_at: now,
            closed_at: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == CapaState::Closed
    }

    pub fn run_id(&self) -> &RunId {
        self.trigger.run_id()
    }
}
