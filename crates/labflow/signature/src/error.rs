use chrono::{DateTime, Utc};
use labflow_ledger::LedgerError;
use labflow_types::{OperatorId, PendingApprovalId, SignatureMeaning};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("pending approval not found: {0}")]
    PendingApprovalNotFound(PendingApprovalId),

    #[error("pending approval {0} is already signed")]
    AlreadySigned(PendingApprovalId),

    #[error("pending approval {0} was withdrawn")]
    ApprovalWithdrawn(PendingApprovalId),

    #[error("pending approval {pending} expired at {expired_at}")]
    ApprovalTimeout {
        pending: PendingApprovalId,
        expired_at: DateTime<Utc>,
    },

    #[error("signature meaning mismatch: expected {expected}, got {got}")]
    SignatureMeaningMismatch {
        expected: SignatureMeaning,
        got: SignatureMeaning,
    },

    #[error("invalid credential for {signer}: {reason}")]
    InvalidCredential { signer: OperatorId, reason: String },

    #[error("content changed since signature was requested ({pending})")]
    ContentChangedSinceRequest { pending: PendingApprovalId },

    #[error("audit write failed: {0}")]
    AuditWriteFailed(#[from] LedgerError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type SignatureResult<T> = Result<T, SignatureError>;
