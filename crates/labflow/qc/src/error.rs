use labflow_ledger::LedgerError;
use labflow_types::ControlLevelId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QcError {
    #[error("invalid control result for level {level}: {reason}")]
    InvalidControl {
        level: ControlLevelId,
        reason: String,
    },

    #[error("audit write failed: {0}")]
    AuditWriteFailed(#[from] LedgerError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type QcResult<T> = Result<T, QcError>;
