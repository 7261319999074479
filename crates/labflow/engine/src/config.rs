//! Engine configuration

use labflow_deviation::DeviationConfig;
use labflow_ledger::RetryPolicy;
use labflow_qc::QcConfig;
use labflow_signature::GateConfig;
use labflow_types::Role;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Audit ledger storage and retry behaviour
    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub signatures: SignatureConfig,

    /// Westgard rule selection
    #[serde(default)]
    pub qc: QcConfig,

    #[serde(default)]
    pub deviations: DeviationConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where audit events are stored
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LedgerBackend {
    /// In-memory (development and tests)
    #[default]
    Memory,

    /// Append-only JSON lines file
    Jsonl { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub backend: LedgerBackend,

    /// Attempts per append, including the first
    #[serde(default = "default_append_attempts")]
    pub append_attempts: u32,

    /// Linear backoff step between attempts
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::Memory,
            append_attempts: default_append_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl LedgerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.append_attempts.max(1),
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureConfig {
    /// How long a signature request stays open before the step fails
    #[serde(default = "default_approval_timeout")]
    pub approval_timeout_secs: u64,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            approval_timeout_secs: default_approval_timeout(),
        }
    }
}

impl SignatureConfig {
    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            approval_timeout: Duration::from_secs(self.approval_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Role an override signer must hold to release a HOLD
    #[serde(default = "default_override_role")]
    pub override_role: Role,

    /// How long a transition waits for the run lock
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,

    /// Replacing submitted step input requires a reason for change
    #[serde(default = "default_true")]
    pub require_reason_for_changes: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            override_role: default_override_role(),
            lock_timeout_ms: default_lock_timeout(),
            require_reason_for_changes: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_append_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    25
}

fn default_approval_timeout() -> u64 {
    24 * 60 * 60
}

fn default_override_role() -> Role {
    Role::new("qa_manager")
}

fn default_lock_timeout() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl EngineConfig {
    /// Load configuration: defaults, then the optional file, then
    /// `LABFLOW_`-prefixed environment variables (`__` between sections).
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&EngineConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("LABFLOW")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Settings for the demo and for tests: short timeouts, in-memory ledger.
    pub fn development() -> Self {
        Self {
            orchestrator: OrchestratorConfig {
                lock_timeout_ms: 1_000,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
