//! Append-only control-sample history

use chrono::{DateTime, Utc};
use labflow_types::{ControlLevelId, ControlSampleResult, RunId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// One point on a Levey-Jennings chart.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeveyJenningsPoint {
    pub run_id: RunId,
    pub value: f64,
    pub z_score: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Every accepted control result, in acceptance order. Never edited.
#[derive(Default)]
pub struct QcHistory {
    results: RwLock<Vec<ControlSampleResult>>,
}

impl QcHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `result` visible and return the history as it was before it.
    ///
    /// The returned snapshot is exactly the evidence the new point must be
    /// evaluated against.
    pub fn append(&self, result: ControlSampleResult) -> Vec<ControlSampleResult> {
        let mut results = self.results.write();
        let prior = results.clone();
        results.push(result);
        prior
    }

    pub fn snapshot(&self) -> Vec<ControlSampleResult> {
        self.results.read().clone()
    }

    pub fn len(&self) -> usize {
        self.results.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn for_level(&self, level: &ControlLevelId) -> Vec<ControlSampleResult> {
        self.results
            .read()
            .iter()
            .filter(|r| &r.level == level)
            .cloned()
            .collect()
    }

    pub fn for_run(&self, run_id: &RunId) -> Vec<ControlSampleResult> {
        self.results
            .read()
            .iter()
            .filter(|r| &r.run_id == run_id)
            .cloned()
            .collect()
    }

    /// Chart series for one control level.
    pub fn levey_jennings_points(&self, level: &ControlLevelId) -> Vec<LeveyJenningsPoint> {
        self.results
            .read()
            .iter()
            .filter(|r| &r.level == level)
            .map(|r| LeveyJenningsPoint {
                run_id: r.run_id.clone(),
                value: r.value,
                z_score: r.z_score(),
                recorded_at: r.recorded_at,
            })
            .collect()
    }
}
