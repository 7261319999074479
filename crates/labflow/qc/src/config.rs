use labflow_types::WestgardRule;
use serde::{Deserialize, Serialize};

/// Which pair of points the `2_2s` rule compares.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TwoTwoSScope {
    /// Two consecutive points of the same control level
    #[default]
    WithinLevel,
    /// The new point and the latest point of another level in the same run
    AcrossLevels,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QcConfig {
    pub enabled_rules: Vec<WestgardRule>,
    pub two_two_s_scope: TwoTwoSScope,
    /// Points from prior runs, per level, that multi-point rules may look back on
    pub cross_run_window: usize,
}

impl Default for QcConfig {
    fn default() -> Self {
        Self {
            enabled_rules: WestgardRule::PRIORITY.to_vec(),
            two_two_s_scope: TwoTwoSScope::WithinLevel,
            cross_run_window: 20,
        }
    }
}

impl QcConfig {
    pub fn with_rules(mut self, rules: impl IntoIterator<Item = WestgardRule>) -> Self {
        self.enabled_rules = rules.into_iter().collect();
        self
    }

    pub fn with_two_two_s_scope(mut self, scope: TwoTwoSScope) -> Self {
        self.two_two_s_scope = scope;
        self
    }

    pub fn with_cross_run_window(mut self, points: usize) -> Self {
        self.cross_run_window = points;
        self
    }

    pub fn is_enabled(&self, rule: WestgardRule) -> bool {
        self.enabled_rules.contains(&rule)
    }
}
