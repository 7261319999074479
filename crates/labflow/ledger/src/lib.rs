//! Append-only audit ledger.
//!
//! Every state change in Labflow is recorded as an [`AuditEvent`] in a
//! per-subject stream (`run:<id>` or `capa:<id>`). Events are hash-chained:
//! each event commits to its predecessor's hash, so any edit, deletion or
//! reordering of stored events is detectable by recomputing the chain.
//!
//! Appends to one stream are serialised; a sequence number is consumed only
//! once the event is durably persisted by the [`AuditStore`].

#![deny(unsafe_code)]

pub mod error;
pub mod event;
pub mod export;
pub mod ledger;
pub mod mocks;
pub mod store;
pub mod verify;

pub use error::{LedgerError, LedgerResult};
pub use event::{AuditEvent, StreamId};
pub use export::{read_export, write_export, ExportRecord, RunExport};
pub use ledger::{AuditLedger, RetryPolicy};
pub use mocks::FlakyAuditStore;
pub use store::{AuditStore, JsonlAuditStore, MemoryAuditStore, StoreError};
pub use verify::{verify_chain, ChainFault, ChainReport};
