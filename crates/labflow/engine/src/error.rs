//! Engine errors and their mapping onto the shared taxonomy

use labflow_deviation::DeviationError;
use labflow_ledger::LedgerError;
use labflow_qc::QcError;
use labflow_signature::SignatureError;
use labflow_types::{CapaId, DefinitionError, ErrorKind, RunId, RunState, SopKey, StepId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid SOP definition: {0}")]
    InvalidDefinition(#[from] DefinitionError),

    #[error("SOP {0} not found")]
    SopNotFound(SopKey),

    #[error("run {0} not found")]
    RunNotFound(RunId),

    #[error("step {step_id} not found in run {run_id}")]
    StepNotFound { run_id: RunId, step_id: StepId },

    #[error("invalid input for run {run_id}: {reason}")]
    InvalidInput {
        run_id: RunId,
        step_id: Option<StepId>,
        reason: String,
    },

    #[error("run {run_id} is {state}, not RUNNING")]
    RunNotRunning { run_id: RunId, state: RunState },

    #[error("run {run_id} is {state}, not HOLD")]
    RunNotHeld { run_id: RunId, state: RunState },

    #[error("run {run_id} is already {state}")]
    RunTerminal { run_id: RunId, state: RunState },

    #[error("another transition is in progress for run {0}")]
    ConcurrencyConflict(RunId),

    #[error("run {0} is being aborted")]
    AbortInProgress(RunId),

    #[error("run {0} is frozen after an integrity failure")]
    RunFrozen(RunId),

    #[error("audit write failed for run {run_id}: {source}")]
    AuditWriteFailed {
        run_id: RunId,
        #[source]
        source: LedgerError,
    },

    #[error("audit read failed for run {run_id}: {source}")]
    AuditReadFailed {
        run_id: RunId,
        #[source]
        source: LedgerError,
    },

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("step {step_id} of run {run_id} failed: {reason}")]
    StepExecutionFailed {
        run_id: RunId,
        step_id: StepId,
        reason: String,
        capa_id: CapaId,
    },

    #[error("signature request for step {step_id} of run {run_id} timed out")]
    ApprovalTimeout {
        run_id: RunId,
        step_id: StepId,
        capa_id: CapaId,
    },

    #[error("hold on run {run_id} is unresolved: {reason}")]
    UnresolvedDeviation { run_id: RunId, reason: String },

    #[error("signature error on run {run_id}: {source}")]
    Signature {
        run_id: RunId,
        step_id: Option<StepId>,
        #[source]
        source: SignatureError,
    },

    #[error("QC error on run {run_id}: {source}")]
    Qc {
        run_id: RunId,
        #[source]
        source: QcError,
    },

    #[error("deviation error: {source}")]
    Deviation {
        run_id: Option<RunId>,
        #[source]
        source: DeviationError,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// What the caller should do about this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidDefinition(_)
            | EngineError::InvalidInput { .. }
            | EngineError::RunNotRunning { .. }
            | EngineError::RunNotHeld { .. }
            | EngineError::RunTerminal { .. }
            | EngineError::Config(_) => ErrorKind::Validation,
            EngineError::SopNotFound(_)
            | EngineError::RunNotFound(_)
            | EngineError::StepNotFound { .. } => ErrorKind::NotFound,
            EngineError::ConcurrencyConflict(_) | EngineError::AbortInProgress(_) => {
                ErrorKind::Concurrency
            }
            EngineError::RunFrozen(_) => ErrorKind::Integrity,
            EngineError::AuditWriteFailed { .. }
            | EngineError::AuditReadFailed { .. }
            | EngineError::Ledger(_)
            | EngineError::Io(_)
            | EngineError::Serialization(_) => ErrorKind::Infrastructure,
            EngineError::StepExecutionFailed { .. } => ErrorKind::StepExecution,
            EngineError::ApprovalTimeout { .. } => ErrorKind::ApprovalTimeout,
            EngineError::UnresolvedDeviation { .. } => ErrorKind::BusinessRule,
            EngineError::Signature { source, .. } => match source {
                SignatureError::PendingApprovalNotFound(_) => ErrorKind::NotFound,
                SignatureError::ApprovalTimeout { .. } => ErrorKind::ApprovalTimeout,
                SignatureError::AuditWriteFailed(_) | SignatureError::Serialization(_) => {
                    ErrorKind::Infrastructure
                }
                SignatureError::AlreadySigned(_)
                | SignatureError::ApprovalWithdrawn(_)
                | SignatureError::SignatureMeaningMismatch { .. }
                | SignatureError::InvalidCredential { .. }
                | SignatureError::ContentChangedSinceRequest { .. } => ErrorKind::BusinessRule,
            },
            EngineError::Qc { source, .. } => match source {
                QcError::InvalidControl { .. } => ErrorKind::Validation,
                QcError::AuditWriteFailed(_) | QcError::Serialization(_) => {
                    ErrorKind::Infrastructure
                }
            },
            EngineError::Deviation { source, .. } => match source {
                DeviationError::NotFound(_) => ErrorKind::NotFound,
                DeviationError::UnauthorizedClosure { .. }
                | DeviationError::AlreadyClosed(_)
                | DeviationError::AlreadyOpened(_)
                | DeviationError::InvalidTransition { .. } => ErrorKind::BusinessRule,
                DeviationError::AuditWriteFailed(_) | DeviationError::Serialization(_) => {
                    ErrorKind::Infrastructure
                }
            },
        }
    }

    pub fn run_id(&self) -> Option<&RunId> {
        match self {
            EngineError::RunNotFound(run_id)
            | EngineError::ConcurrencyConflict(run_id)
            | EngineError::AbortInProgress(run_id)
            | EngineError::RunFrozen(run_id)
            | EngineError::StepNotFound { run_id, .. }
            | EngineError::InvalidInput { run_id, .. }
            | EngineError::RunNotRunning { run_id, .. }
            | EngineError::RunNotHeld { run_id, .. }
            | EngineError::RunTerminal { run_id, .. }
            | EngineError::AuditWriteFailed { run_id, .. }
            | EngineError::AuditReadFailed { run_id, .. }
            | EngineError::StepExecutionFailed { run_id, .. }
            | EngineError::ApprovalTimeout { run_id, .. }
            | EngineError::UnresolvedDeviation { run_id, .. }
            | EngineError::Signature { run_id, .. }
            | EngineError::Qc { run_id, .. } => Some(run_id),
            EngineError::Deviation { run_id, .. } => run_id.as_ref(),
            EngineError::InvalidDefinition(_)
            | EngineError::SopNotFound(_)
            | EngineError::Config(_)
            | EngineError::Ledger(_)
            | EngineError::Io(_)
            | EngineError::Serialization(_) => None,
        }
    }

    pub fn step_id(&self) -> Option<&StepId> {
        match self {
            EngineError::StepNotFound { step_id, .. }
            | EngineError::StepExecutionFailed { step_id, .. }
            | EngineError::ApprovalTimeout { step_id, .. } => Some(step_id),
            EngineError::InvalidInput { step_id, .. } | EngineError::Signature { step_id, .. } => {
                step_id.as_ref()
            }
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_run_error_carries_kind_and_ids() {
        let err = EngineError::StepExecutionFailed {
            run_id: RunId::new("r1"),
            step_id: StepId::new("s2"),
            reason: "instrument not qualified".into(),
            capa_id: CapaId::new("c1"),
        };
        assert_eq!(err.kind(), ErrorKind::StepExecution);
        assert_eq!(err.run_id(), Some(&RunId::new("r1")));
        assert_eq!(err.step_id(), Some(&StepId::new("s2")));
        assert!(!err.is_retryable());
    }

    #[test]
    fn signature_errors_are_business_rules() {
        let err = EngineError::Signature {
            run_id: RunId::new("r1"),
            step_id: None,
            source: SignatureError::SignatureMeaningMismatch {
                expected: labflow_types::SignatureMeaning::Approved,
                got: labflow_types::SignatureMeaning::Reviewed,
            },
        };
        assert_eq!(err.kind(), ErrorKind::BusinessRule);
    }

    #[test]
    fn lock_contention_is_retryable() {
        assert!(EngineError::ConcurrencyConflict(RunId::new("r")).is_retryable());
        assert_eq!(
            EngineError::RunFrozen(RunId::new("r")).kind(),
            ErrorKind::Integrity
        );
    }
}
