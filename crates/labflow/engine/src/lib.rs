//! Labflow execution engine.
//!
//! Drives runs of published SOP definitions step by step:
//!
//! - [`SopRegistry`] holds published, immutable definitions
//! - [`StepExecutor`] checks inputs and signature requirements for one step
//! - [`RunOrchestrator`] owns the run state machine, writes every transition
//!   to the audit ledger before acknowledging it, and routes QC rejections
//!   and step failures into HOLD with a deviation record
//!
//! Configuration and tracing setup live in [`config`] and [`telemetry`].

#![deny(unsafe_code)]

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod registry;
pub mod telemetry;

pub use bootstrap::{build_orchestrator, build_with_store};
pub use config::{
    EngineConfig, LedgerBackend, LedgerConfig, LoggingConfig, OrchestratorConfig, SignatureConfig,
};
pub use error::{EngineError, EngineResult};
pub use executor::{StepExecution, StepExecutor, StepFailure};
pub use orchestrator::{HoldResolution, RunOrchestrator, StepOutcome};
pub use registry::SopRegistry;
