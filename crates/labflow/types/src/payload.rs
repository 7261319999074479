//! Normalized instrument / operator payloads accepted at the ingestion boundary

use crate::{ControlLevelId, InstrumentId, OperatorId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Qualification status reported by the connector for the source instrument.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualificationStatus {
    Qualified,
    Expired,
    NotQualified,
}

/// Provenance passed in alongside every submitted result.
///
/// The core trusts these values; connectors are responsible for the
/// checksum over the raw instrument export.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceTag {
    pub instrument_id: InstrumentId,
    pub checksum: String,
    pub qualification: QualificationStatus,
}

impl ProvenanceTag {
    pub fn qualified(instrument_id: impl Into<String>, checksum: impl Into<String>) -> Self {
        Self {
            instrument_id: InstrumentId::new(instrument_id),
            checksum: checksum.into(),
            qualification: QualificationStatus::Qualified,
        }
    }
}

/// A control-sample measurement as submitted by a connector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlMeasurement {
    pub level: ControlLevelId,
    pub value: f64,
    pub expected_mean: f64,
    pub expected_sd: f64,
}

impl ControlMeasurement {
    pub fn new(level: impl Into<String>, value: f64, expected_mean: f64, expected_sd: f64) -> Self {
        Self {
            level: ControlLevelId::new(level),
            value,
            expected_mean,
            expected_sd,
        }
    }

    /// Measurements must be finite and carry a positive SD.
    pub fn is_well_formed(&self) -> bool {
        self.value.is_finite()
            && self.expected_mean.is_finite()
            && self.expected_sd.is_finite()
            && self.expected_sd > 0.0
    }
}

/// Structured step input: operator metadata, free-form fields and controls.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StepPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<OperatorId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reagent_lot: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub controls: Vec<ControlMeasurement>,
    /// Required when replacing an earlier submission for the same step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_for_change: Option<String>,
}

impl StepPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_operator(mut self, operator: impl Into<String>) -> Self {
        self.operator = Some(OperatorId::new(operator));
        self
    }

    pub fn with_reagent_lot(mut self, lot: impl Into<String>) -> Self {
        self.reagent_lot = Some(lot.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_control(mut self, control: ControlMeasurement) -> Self {
        self.controls.push(control);
        self
    }

    pub fn with_reason_for_change(mut self, reason: impl Into<String>) -> Self {
        self.reason_for_change = Some(reason.into());
        self
    }

    /// Whether a named input is present. `operator` and `reagent_lot` are
    /// first-class inputs; everything else is looked up in `fields`.
    pub fn has_input(&self, name: &str) -> bool {
        match name {
            "operator" => self.operator.is_some(),
            "reagent_lot" => self.reagent_lot.as_deref().is_some_and(|l| !l.trim().is_empty()),
            "controls" => !self.controls.is_empty(),
            other => self
                .fields
                .get(other)
                .is_some_and(|value| !value.is_null()),
        }
    }
}
