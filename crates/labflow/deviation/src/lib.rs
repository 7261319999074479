//! Deviation manager.
//!
//! Opens and tracks CAPA records for QC rejections, step failures and
//! approval timeouts. Records move `OPEN → INVESTIGATING → CLOSED`; closing
//! always takes an explicit, authorized human action with resolution notes.
//! Each change is audited in the record's own `capa:<id>` stream and
//! published to external trackers at least once.

#![deny(unsafe_code)]

pub mod error;
pub mod manager;
pub mod mocks;
pub mod publisher;

pub use error::{DeviationError, DeviationResult};
pub use manager::{DeviationConfig, DeviationManager};
pub use mocks::RecordingCapaPublisher;
pub use publisher::{CapaEvent, CapaPublisher, ChannelCapaPublisher, NullCapaPublisher, PublishError};
