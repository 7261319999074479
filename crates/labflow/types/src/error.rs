//! Shared error taxonomy

use serde::{Deserialize, Serialize};

/// Classification every component error maps onto.
///
/// Tells a caller what to do next: fix the input, re-read and retry,
/// escalate to a human, or page an operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed definition or input; nothing changed, retry with corrected input
    Validation,
    /// Another transition is in flight for the same run; re-read state and retry
    Concurrency,
    /// Audit chain mismatch; the run is frozen pending investigation
    Integrity,
    /// A signature request expired; the run moves to HOLD
    ApprovalTimeout,
    /// A step failed; the run moves to HOLD and a deviation is opened
    StepExecution,
    /// A business rule refused the operation; needs human action
    BusinessRule,
    /// Storage or delivery failure that survived bounded retries
    Infrastructure,
    /// Unknown run, step, approval or record
    NotFound,
}

impl ErrorKind {
    /// Whether retrying the identical call can succeed without human action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Concurrency | ErrorKind::Infrastructure)
    }
}
