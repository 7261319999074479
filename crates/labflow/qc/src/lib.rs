//! QC rule engine.
//!
//! Evaluates control-sample results against the Westgard multi-rule set.
//! Evaluation is a pure function of the prior history and the new point, so
//! re-running it over the same evidence reproduces the same findings byte
//! for byte.

#![deny(unsafe_code)]

pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod service;

pub use config::{QcConfig, TwoTwoSScope};
pub use engine::QcRuleEngine;
pub use error::{QcError, QcResult};
pub use history::{LeveyJenningsPoint, QcHistory};
pub use service::QcService;
