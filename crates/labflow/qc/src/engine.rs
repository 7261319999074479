//! Westgard rule evaluation

use crate::{QcConfig, QcError, QcResult, TwoTwoSScope};
use labflow_types::{ControlSampleResult, QcRuleViolation, WestgardRule};

/// Evaluates one new control point against prior history.
#[derive(Clone, Debug, Default)]
pub struct QcRuleEngine {
    config: QcConfig,
}

/// The evidence one evaluation looks at, oldest point first.
struct Evidence<'a> {
    /// Earlier points of the same level: prior runs (bounded) then this run
    level: Vec<&'a ControlSampleResult>,
    /// Latest point of a different level in the same run
    other_level: Option<&'a ControlSampleResult>,
    new: &'a ControlSampleResult,
}

impl<'a> Evidence<'a> {
    /// The last `n` points of the level series ending with the new point.
    fn tail(&self, n: usize) -> Option<Vec<&'a ControlSampleResult>> {
        if n == 0 || self.level.len() + 1 < n {
            return None;
        }
        let mut tail: Vec<&ControlSampleResult> =
            self.level[self.level.len() + 1 - n..].to_vec();
        tail.push(self.new);
        Some(tail)
    }
}

impl QcRuleEngine {
    pub fn new(config: QcConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QcConfig {
        &self.config
    }

    /// Reject inputs that cannot be evaluated.
    pub fn validate(&self, result: &ControlSampleResult) -> QcResult<()> {
        let invalid = |reason: &str| QcError::InvalidControl {
            level: result.level.clone(),
            reason: reason.to_string(),
        };
        if !result.value.is_finite() {
            return Err(invalid("measured value is not finite"));
        }
        if !result.expected_mean.is_finite() {
            return Err(invalid("expected mean is not finite"));
        }
        if !(result.expected_sd.is_finite() && result.expected_sd > 0.0) {
            return Err(invalid("expected SD must be positive"));
        }
        Ok(())
    }

    /// Evaluate `new` against `history` (every previously accepted point, in
    /// acceptance order). Violations come back in rule priority order.
    pub fn evaluate(
        &self,
        history: &[ControlSampleResult],
        new: &ControlSampleResult,
    ) -> QcResult<Vec<QcRuleViolation>> {
        self.validate(new)?;
        let evidence = self.gather(history, new);

        let mut violations = Vec::new();
        for rule in WestgardRule::PRIORITY {
            if !self.config.is_enabled(rule) {
                continue;
            }
            if rule == WestgardRule::OneTwoS && !violations.is_empty() {
                continue;
            }
            if let Some(window) = self.check(rule, &evidence) {
                let window = window.into_iter().cloned().collect();
                violations.push(QcRuleViolation::new(
                    rule,
                    new.level.clone(),
                    new.run_id.clone(),
                    window,
                )?);
            }
        }
        Ok(violations)
    }

    /// Evaluate each point of `series` against the points before it.
    pub fn evaluate_series(
        &self,
        series: &[ControlSampleResult],
    ) -> QcResult<Vec<Vec<QcRuleViolation>>> {
        (0..series.len())
            .map(|i| self.evaluate(&series[..i], &series[i]))
            .collect()
    }

    fn gather<'a>(
        &self,
        history: &'a [ControlSampleResult],
        new: &'a ControlSampleResult,
    ) -> Evidence<'a> {
        let (this_run, prior_runs): (Vec<_>, Vec<_>) = history
            .iter()
            .filter(|r| r.level == new.level)
            .partition(|r| r.run_id == new.run_id);

        let skip = prior_runs.len().saturating_sub(self.config.cross_run_window);
        let mut level: Vec<&ControlSampleResult> = prior_runs.into_iter().skip(skip).collect();
        level.extend(this_run);

        let other_level = history
            .iter()
            .rev()
            .find(|r| r.run_id == new.run_id && r.level != new.level);

        Evidence {
            level,
            other_level,
            new,
        }
    }

    fn check<'a>(
        &self,
        rule: WestgardRule,
        evidence: &Evidence<'a>,
    ) -> Option<Vec<&'a ControlSampleResult>> {
        let z = evidence.new.z_score();
        match rule {
            WestgardRule::OneThreeS => (z.abs() > 3.0).then(|| vec![evidence.new]),
            WestgardRule::OneTwoS => (z.abs() > 2.0).then(|| vec![evidence.new]),
            WestgardRule::TwoTwoS => {
                let previous = match self.config.two_two_s_scope {
                    TwoTwoSScope::WithinLevel => evidence.level.last().copied(),
                    TwoTwoSScope::AcrossLevels => evidence.other_level,
                }?;
                let pair = vec![previous, evidence.new];
                same_side_beyond(&pair, 2.0).then_some(pair)
            }
            WestgardRule::RFourS => {
                let other = evidence.other_level?;
                ((z - other.z_score()).abs() > 4.0).then(|| vec![other, evidence.new])
            }
            WestgardRule::FourOneS => {
                let tail = evidence.tail(4)?;
                same_side_beyond(&tail, 1.0).then_some(tail)
            }
            WestgardRule::TenX => {
                let tail = evidence.tail(10)?;
                same_side_beyond(&tail, 0.0).then_some(tail)
            }
        }
    }
}

/// All points strictly beyond `limit` SD on the same side of the mean.
fn same_side_beyond(points: &[&ControlSampleResult], limit: f64) -> bool {
    let above = points.iter().all(|p| p.z_score() > limit);
    let below = points.iter().all(|p| p.z_score() < -limit);
    !points.is_empty() && (above || below)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use labflow_types::{RunId, Severity};
    use proptest::prelude::*;

    fn point(run: &str, level: &str, value: f64, minute: u32) -> ControlSampleResult {
        ControlSampleResult::new(
            RunId::new(run),
            level,
            value,
            100.0,
            2.0,
            Utc.with_ymd_and_hms(2024, 3, 1, 8, minute, 0).unwrap(),
        )
    }

    fn series(run: &str, level: &str, values: &[f64]) -> Vec<ControlSampleResult> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| point(run, level, *v, i as u32))
            .collect()
    }

    fn rules(violations: &[QcRuleViolation]) -> Vec<WestgardRule> {
        violations.iter().map(|v| v.rule).collect()
    }

    fn classic() -> QcRuleEngine {
        QcRuleEngine::new(QcConfig::default().with_rules([
            WestgardRule::OneThreeS,
            WestgardRule::TwoTwoS,
            WestgardRule::RFourS,
            WestgardRule::FourOneS,
            WestgardRule::TenX,
        ]))
    }

    #[test]
    fn one_three_s_boundary() {
        let engine = QcRuleEngine::default();
        let hit = engine.evaluate(&[], &point("r", "L1", 107.0, 0)).unwrap();
        assert_eq!(rules(&hit), vec![WestgardRule::OneThreeS]);
        assert_eq!(hit[0].severity, Severity::Rejection);

        let miss = engine.evaluate(&[], &point("r", "L1", 105.9, 0)).unwrap();
        assert!(!rules(&miss).contains(&WestgardRule::OneThreeS));
    }

    #[test]
    fn exactly_three_sd_is_not_beyond() {
        let engine = QcRuleEngine::default();
        let result = engine.evaluate(&[], &point("r", "L1", 106.0, 0)).unwrap();
        assert_eq!(rules(&result), vec![WestgardRule::OneTwoS]);
    }

    #[test]
    fn one_two_s_is_only_a_warning() {
        let engine = QcRuleEngine::default();
        let result = engine.evaluate(&[], &point("r", "L1", 104.5, 0)).unwrap();
        assert_eq!(rules(&result), vec![WestgardRule::OneTwoS]);
        assert!(!result[0].is_rejection());
    }

    #[test]
    fn one_two_s_is_suppressed_by_a_rejection() {
        let engine = QcRuleEngine::default();
        let history = series("r", "L1", &[104.5]);
        let result = engine.evaluate(&history, &point("r", "L1", 104.8, 1)).unwrap();
        assert_eq!(rules(&result), vec![WestgardRule::TwoTwoS]);
    }

    #[test]
    fn two_two_s_within_level() {
        let engine = classic();
        let history = series("r", "L1", &[104.5]);
        let result = engine.evaluate(&history, &point("r", "L1", 104.2, 1)).unwrap();
        assert_eq!(rules(&result), vec![WestgardRule::TwoTwoS]);
        assert_eq!(result[0].window.len(), 2);

        let opposite = engine.evaluate(&history, &point("r", "L1", 95.5, 1)).unwrap();
        assert!(!rules(&opposite).contains(&WestgardRule::TwoTwoS));
    }

    #[test]
    fn two_two_s_across_levels_when_configured() {
        let engine = QcRuleEngine::new(
            QcConfig::default()
                .with_rules([WestgardRule::TwoTwoS])
                .with_two_two_s_scope(TwoTwoSScope::AcrossLevels),
        );
        let history = vec![point("r", "L1", 104.5, 0)];
        let result = engine.evaluate(&history, &point("r", "L2", 104.4, 1)).unwrap();
        assert_eq!(rules(&result), vec![WestgardRule::TwoTwoS]);

        let within = QcRuleEngine::new(QcConfig::default().with_rules([WestgardRule::TwoTwoS]));
        assert!(within
            .evaluate(&history, &point("r", "L2", 104.4, 1))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn r_four_s_spans_levels_in_one_run() {
        let engine = classic();
        let history = vec![point("r", "L1", 104.5, 0)];
        let result = engine.evaluate(&history, &point("r", "L2", 95.4, 1)).unwrap();
        assert_eq!(rules(&result), vec![WestgardRule::RFourS]);
        assert_eq!(result[0].window[0].level.as_str(), "L1");

        let other_run = vec![point("earlier", "L1", 104.5, 0)];
        let result = engine.evaluate(&other_run, &point("r", "L2", 95.4, 1)).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn four_one_s_needs_four_on_one_side() {
        let engine = classic();
        let history = series("r", "L1", &[102.5, 102.2, 103.0]);
        let result = engine.evaluate(&history, &point("r", "L1", 102.1, 3)).unwrap();
        assert_eq!(rules(&result), vec![WestgardRule::FourOneS]);
        assert_eq!(result[0].window.len(), 4);

        let broken = series("r", "L1", &[102.5, 101.5, 103.0]);
        let result = engine.evaluate(&broken, &point("r", "L1", 102.1, 3)).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn ten_x_breaks_on_the_mean() {
        let engine = classic();
        let nine = series("r", "L1", &[100.5; 9]);
        let result = engine.evaluate(&nine, &point("r", "L1", 100.2, 9)).unwrap();
        assert_eq!(rules(&result), vec![WestgardRule::TenX]);

        let mut with_mean = nine.clone();
        with_mean[4].value = 100.0;
        let result = engine.evaluate(&with_mean, &point("r", "L1", 100.2, 9)).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn multi_run_rules_use_bounded_prior_window() {
        let prior = series("earlier", "L1", &[102.5, 102.5, 102.5]);
        let current = point("r", "L1", 102.5, 5);

        let wide = QcRuleEngine::new(QcConfig::default().with_rules([WestgardRule::FourOneS]));
        assert_eq!(rules(&wide.evaluate(&prior, &current).unwrap()), vec![WestgardRule::FourOneS]);

        let narrow = QcRuleEngine::new(
            QcConfig::default()
                .with_rules([WestgardRule::FourOneS])
                .with_cross_run_window(2),
        );
        assert!(narrow.evaluate(&prior, &current).unwrap().is_empty());
    }

    #[test]
    fn several_rules_report_in_priority_order() {
        let engine = QcRuleEngine::default();
        let history = vec![point("r", "L1", 104.5, 0), point("r", "L2", 94.0, 1)];
        let result = engine.evaluate(&history, &point("r", "L1", 107.0, 2)).unwrap();
        assert_eq!(
            rules(&result),
            vec![WestgardRule::OneThreeS, WestgardRule::TwoTwoS, WestgardRule::RFourS]
        );
    }

    #[test]
    fn invalid_controls_are_rejected() {
        let engine = QcRuleEngine::default();
        let mut bad = point("r", "L1", 100.0, 0);
        bad.expected_sd = 0.0;
        assert!(matches!(
            engine.evaluate(&[], &bad),
            Err(QcError::InvalidControl { .. })
        ));
        bad.expected_sd = 2.0;
        bad.value = f64::NAN;
        assert!(engine.validate(&bad).is_err());
    }

    #[test]
    fn reference_history_is_deterministic() {
        let engine = classic();
        let history = series(
            "r",
            "L1",
            &[98.0, 102.0, 97.0, 103.0, 96.0, 104.0, 99.0, 101.0, 99.5, 100.5],
        );
        let first = engine.evaluate_series(&history).unwrap();
        let second = engine.evaluate_series(&history).unwrap();
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
        assert!(first.iter().all(Vec::is_empty));
    }

    proptest! {
        #[test]
        fn evaluation_is_deterministic(values in prop::collection::vec(85.0f64..115.0, 1..30)) {
            let engine = QcRuleEngine::default();
            let history = series("r", "L1", &values);
            let first = engine.evaluate_series(&history).unwrap();
            let second = engine.evaluate_series(&history).unwrap();
            prop_assert_eq!(serde_json::to_vec(&first).unwrap(), serde_json::to_vec(&second).unwrap());
        }

        #[test]
        fn one_three_s_matches_threshold(value in 85.0f64..115.0) {
            let engine = QcRuleEngine::default();
            let result = engine.evaluate(&[], &point("r", "L1", value, 0)).unwrap();
            let fired = result.iter().any(|v| v.rule == WestgardRule::OneThreeS);
            prop_assert_eq!(fired, ((value - 100.0) / 2.0).abs() > 3.0);
        }
    }
}
