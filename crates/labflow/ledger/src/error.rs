use crate::{StoreError, StreamId};
use thiserror::Error;

/// Ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The event could not be persisted; nothing was recorded
    #[error("audit write failed for {stream} after {attempts} attempt(s): {reason}")]
    WriteFailed {
        stream: StreamId,
        attempts: u32,
        reason: String,
    },

    #[error("audit stream {0} is sealed")]
    StreamSealed(StreamId),

    #[error("failed to read audit stream {stream}: {source}")]
    Read {
        stream: StreamId,
        #[source]
        source: StoreError,
    },

    #[error("invalid export at line {line}: {reason}")]
    InvalidExport { line: usize, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type LedgerResult<T> = Result<T, LedgerError>;
