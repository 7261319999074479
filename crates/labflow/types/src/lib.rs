//! Domain types for the Labflow execution core
//!
//! Everything the execution, audit and QC-gating components exchange is
//! defined here so that each component crate only depends on this crate
//! and on the components it actually drives:
//!
//! - [`SopDefinition`] / [`StepSpec`]: immutable, versioned procedure templates
//! - [`RunInstance`] / [`StepRecord`]: one execution of a procedure
//! - [`Signature`]: electronic signature bound to a content [`Digest`]
//! - [`ControlSampleResult`] / [`QcRuleViolation`]: QC evidence and findings
//! - [`CapaRecord`]: deviation / corrective action tracking
//! - [`ErrorKind`]: the shared error taxonomy every component maps onto

#![deny(unsafe_code)]

pub mod capa;
pub mod digest;
pub mod error;
pub mod ids;
pub mod payload;
pub mod qc;
pub mod run;
pub mod signature;
pub mod sop;

pub use capa::{Actor, CapaRecord, CapaState, DeviationTrigger};
pub use digest::{Digest, DigestParseError};
pub use error::ErrorKind;
pub use ids::{
    CapaId, ControlLevelId, InstrumentId, OperatorId, PendingApprovalId, Role, RunId,
    SignatureId, StepId, StepRecordId, ViolationId,
};
pub use payload::{ControlMeasurement, ProvenanceTag, QualificationStatus, StepPayload};
pub use qc::{ControlSampleResult, QcRuleViolation, Severity, WestgardRule};
pub use run::{HoldCause, HoldReason, RunInstance, RunState, StepInputs, StepRecord, StepStatus};
pub use signature::{Signature, SignatureMeaning, SignatureTarget, TransitionAction};
pub use sop::{DefinitionError, SopDefinition, SopKey, SopStatus, StepSpec};
