//! Control-sample results and Westgard rule findings

use crate::{ControlLevelId, ControlMeasurement, Digest, RunId, ViolationId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A control-sample measurement accepted into QC history. Never mutated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlSampleResult {
    pub run_id: RunId,
    pub level: ControlLevelId,
    pub value: f64,
    pub expected_mean: f64,
    pub expected_sd: f64,
    pub recorded_at: DateTime<Utc>,
}

impl ControlSampleResult {
    pub fn new(
        run_id: RunId,
        level: impl Into<String>,
        value: f64,
        expected_mean: f64,
        expected_sd: f64,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            level: ControlLevelId::new(level),
            value,
            expected_mean,
            expected_sd,
            recorded_at,
        }
    }

    pub fn from_measurement(
        run_id: RunId,
        measurement: &ControlMeasurement,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            level: measurement.level.clone(),
            value: measurement.value,
            expected_mean: measurement.expected_mean,
            expected_sd: measurement.expected_sd,
            recorded_at,
        }
    }

    /// Distance from the expected mean in SD units.
    pub fn z_score(&self) -> f64 {
        if self.expected_sd > 0.0 {
            (self.value - self.expected_mean) / self.expected_sd
        } else {
            0.0
        }
    }
}

/// Finding severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Rejection,
    Warning,
}

/// The Westgard multi-rule set.
///
/// Adding a rule means adding a variant here, placing it in
/// [`WestgardRule::PRIORITY`], and giving it an evaluator; existing
/// evaluators are untouched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WestgardRule {
    #[serde(rename = "1_3s")]
    OneThreeS,
    #[serde(rename = "2_2s")]
    TwoTwoS,
    #[serde(rename = "R_4s")]
    RFourS,
    #[serde(rename = "4_1s")]
    FourOneS,
    #[serde(rename = "10x")]
    TenX,
    #[serde(rename = "1_2s")]
    OneTwoS,
}

impl WestgardRule {
    /// Fixed evaluation order, most severe first.
    pub const PRIORITY: [WestgardRule; 6] = [
        WestgardRule::OneThreeS,
        WestgardRule::TwoTwoS,
        WestgardRule::RFourS,
        WestgardRule::FourOneS,
        WestgardRule::TenX,
        WestgardRule::OneTwoS,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            WestgardRule::OneThreeS => "1_3s",
            WestgardRule::TwoTwoS => "2_2s",
            WestgardRule::RFourS => "R_4s",
            WestgardRule::FourOneS => "4_1s",
            WestgardRule::TenX => "10x",
            WestgardRule::OneTwoS => "1_2s",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::PRIORITY.into_iter().find(|rule| rule.code() == code)
    }

    pub fn severity(&self) -> Severity {
        match self {
            WestgardRule::OneTwoS => Severity::Warning,
            _ => Severity::Rejection,
        }
    }

    pub fn priority(&self) -> usize {
        Self::PRIORITY
            .iter()
            .position(|rule| rule == self)
            .unwrap_or(Self::PRIORITY.len())
    }
}

impl std::fmt::Display for WestgardRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// A rule match. Generated, never edited.
///
/// `window` is a copy of the immutable evidence that triggered the rule,
/// oldest point first, the evaluated point last.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QcRuleViolation {
    pub id: ViolationId,
    pub rule: WestgardRule,
    pub level: ControlLevelId,
    pub run_id: RunId,
    pub window: Vec<ControlSampleResult>,
    pub severity: Severity,
}

impl QcRuleViolation {
    /// Build a violation whose id is derived from its content, so the same
    /// evidence always yields the same id.
    pub fn new(
        rule: WestgardRule,
        level: ControlLevelId,
        run_id: RunId,
        window: Vec<ControlSampleResult>,
    ) -> Result<Self, serde_json::Error> {
        let id = Digest::of_json("labflow-qc-violation-v1", &(rule, &level, &run_id, &window))?;
        Ok(Self {
            id: ViolationId::new(id.to_hex()),
            severity: rule.severity(),
            rule,
            level,
            run_id,
            window,
        })
    }

    pub fn is_rejection(&self) -> bool {
        self.severity == Severity::Rejection
    }
}
