use labflow_ledger::LedgerError;
use labflow_types::{CapaId, CapaState};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviationError {
    #[error("CAPA record not found: {0}")]
    NotFound(CapaId),

    #[error("closure of {capa} refused: {reason}")]
    UnauthorizedClosure { capa: CapaId, reason: String },

    #[error("CAPA record {0} is already open")]
    AlreadyOpened(CapaId),

    #[error("CAPA record {0} is already closed")]
    AlreadyClosed(CapaId),

    #[error("CAPA record {capa} cannot move from {from} to {to}")]
    InvalidTransition {
        capa: CapaId,
        from: CapaState,
        to: CapaState,
    },

    #[error("audit write failed: {0}")]
    AuditWriteFailed(#[from] LedgerError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type DeviationResult<T> = Result<T, DeviationError>;
