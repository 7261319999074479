//! SOP definitions: immutable, versioned step templates
//!
//! A definition starts as a draft, is validated, and is then published.
//! Published definitions are frozen; changing a procedure means
//! publishing a new version under the same name.

use crate::{ControlLevelId, OperatorId, SignatureMeaning, StepId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Structural problems with a definition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("SOP name must not be empty")]
    EmptyName,

    #[error("SOP version must be at least 1")]
    InvalidVersion,

    #[error("SOP must contain at least one step")]
    NoSteps,

    #[error("duplicate step id: {0}")]
    DuplicateStep(StepId),

    #[error("step {step} references unknown prior step {missing}")]
    UnknownPriorStep { step: StepId, missing: StepId },

    #[error("step {0} requires a signature but declares no meaning")]
    MissingSignatureMeaning(StepId),

    #[error("step {0} triggers QC evaluation but lists no control levels")]
    EmptyQcTrigger(StepId),

    #[error("SOP {0} is not published")]
    Unpublished(SopKey),

    #[error("SOP {0} is already published and cannot be modified")]
    AlreadyPublished(SopKey),
}

/// (name, version) pair identifying a definition.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SopKey {
    pub name: String,
    pub version: u32,
}

impl SopKey {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl std::fmt::Display for SopKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@v{}", self.name, self.version)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SopStatus {
    Draft,
    Published,
}

/// One step of a procedure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: StepId,
    pub name: String,
    /// Inputs that must be present before the step can be recorded
    #[serde(default)]
    pub required_inputs: Vec<String>,
    #[serde(default)]
    pub requires_signature: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_meaning: Option<SignatureMeaning>,
    /// Control levels this step reports; `Some` turns on QC evaluation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qc_levels: Option<Vec<ControlLevelId>>,
    /// Prior steps that must be recorded before this one
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    /// Minimum time between the step becoming current and being recorded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_duration_secs: Option<u64>,
}

impl StepSpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: StepId::new(id),
            name: name.into(),
            required_inputs: Vec::new(),
            requires_signature: false,
            signature_meaning: None,
            qc_levels: None,
            depends_on: Vec::new(),
            min_duration_secs: None,
        }
    }

    pub fn with_required_input(mut self, input: impl Into<String>) -> Self {
        self.required_inputs.push(input.into());
        self
    }

    pub fn with_signature(mut self, meaning: SignatureMeaning) -> Self {
        self.requires_signature = true;
        self.signature_meaning = Some(meaning);
        self
    }

    pub fn with_qc<I, S>(mut self, levels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.qc_levels = Some(levels.into_iter().map(ControlLevelId::new).collect());
        self
    }

    pub fn depends_on(mut self, step: impl Into<String>) -> Self {
        self.depends_on.push(StepId::new(step));
        self
    }

    pub fn with_min_duration(mut self, secs: u64) -> Self {
        self.min_duration_secs = Some(secs);
        self
    }

    pub fn triggers_qc(&self) -> bool {
        self.qc_levels.is_some()
    }
}

/// A versioned standard operating procedure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SopDefinition {
    pub name: String,
    pub version: u32,
    #[serde(default)]
    pub description: String,
    pub author: OperatorId,
    pub steps: Vec<StepSpec>,
    pub status: SopStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

impl SopDefinition {
    pub fn new(name: impl Into<String>, version: u32, author: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version,
            description: String::new(),
            author: OperatorId::new(author),
            steps: Vec::new(),
            status: SopStatus::Draft,
            published_at: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn key(&self) -> SopKey {
        SopKey::new(self.name.clone(), self.version)
    }

    pub fn is_published(&self) -> bool {
        self.status == SopStatus::Published
    }

    /// Append a step to a draft definition.
    pub fn add_step(&mut self, step: StepSpec) -> Result<(), DefinitionError> {
        if self.is_published() {
            return Err(DefinitionError::AlreadyPublished(self.key()));
        }
        if self.steps.iter().any(|s| s.id == step.id) {
            return Err(DefinitionError::DuplicateStep(step.id));
        }
        self.steps.push(step);
        Ok(())
    }

    pub fn with_step(mut self, step: StepSpec) -> Result<Self, DefinitionError> {
        self.add_step(step)?;
        Ok(self)
    }

    pub fn step(&self, id: &StepId) -> Option<&StepSpec> {
        self.steps.iter().find(|s| &s.id == id)
    }

    pub fn step_index(&self, id: &StepId) -> Option<usize> {
        self.steps.iter().position(|s| &s.id == id)
    }

    /// Validate structural correctness.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.name.trim().is_empty() {
            return Err(DefinitionError::EmptyName);
        }
        if self.version == 0 {
            return Err(DefinitionError::InvalidVersion);
        }
        if self.steps.is_empty() {
            return Err(DefinitionError::NoSteps);
        }

        let mut seen: HashSet<&StepId> = HashSet::new();
        for step in &self.steps {
            // dependencies may only point backwards
            for prior in &step.depends_on {
                if !seen.contains(prior) {
                    return Err(DefinitionError::UnknownPriorStep {
                        step: step.id.clone(),
                        missing: prior.clone(),
                    });
                }
            }
            if !seen.insert(&step.id) {
                return Err(DefinitionError::DuplicateStep(step.id.clone()));
            }
            if step.requires_signature && step.signature_meaning.is_none() {
                return Err(DefinitionError::MissingSignatureMeaning(step.id.clone()));
            }
            if matches!(&step.qc_levels, Some(levels) if levels.is_empty()) {
                return Err(DefinitionError::EmptyQcTrigger(step.id.clone()));
            }
        }
        Ok(())
    }

    /// Validate and freeze the definition.
    pub fn publish(mut self) -> Result<Self, DefinitionError> {
        if self.is_published() {
            return Err(DefinitionError::AlreadyPublished(self.key()));
        }
        self.validate()?;
        self.status = SopStatus::Published;
        self.published_at = Some(Utc::now());
        Ok(self)
    }

    /// Check a definition is fit to start a run from.
    pub fn ensure_runnable(&self) -> Result<(), DefinitionError> {
        if !self.is_published() {
            return Err(DefinitionError::Unpublished(self.key()));
        }
        self.validate()
    }
}
