//! QC evaluation wired to the audit ledger

use crate::{QcHistory, QcResult, QcRuleEngine};
use labflow_ledger::{AuditLedger, StreamId};
use labflow_types::{ControlLevelId, ControlSampleResult, QcRuleViolation};
use std::sync::Arc;
use tracing::{info, warn};

/// Records control results and evaluates them.
///
/// Order per result: audit the result, make it visible in history, evaluate
/// it against the history that preceded it, audit each violation.
pub struct QcService {
    engine: QcRuleEngine,
    history: Arc<QcHistory>,
    ledger: Arc<AuditLedger>,
}

impl QcService {
    pub fn new(engine: QcRuleEngine, history: Arc<QcHistory>, ledger: Arc<AuditLedger>) -> Self {
        Self {
            engine,
            history,
            ledger,
        }
    }

    pub fn engine(&self) -> &QcRuleEngine {
        &self.engine
    }

    pub fn history(&self) -> &Arc<QcHistory> {
        &self.history
    }

    /// Check a batch of results before anything is recorded.
    pub fn validate_all(&self, results: &[ControlSampleResult]) -> QcResult<()> {
        results.iter().try_for_each(|r| self.engine.validate(r))
    }

    pub async fn record(&self, result: ControlSampleResult) -> QcResult<Vec<QcRuleViolation>> {
        self.engine.validate(&result)?;
        let stream = StreamId::run(&result.run_id);

        self.ledger
            .append(&stream, "qc_result_recorded", serde_json::to_value(&result)?)
            .await?;
        let prior = self.history.append(result.clone());
        let violations = self.engine.evaluate(&prior, &result)?;

        for violation in &violations {
            self.ledger
                .append(&stream, "qc_violation", serde_json::to_value(violation)?)
                .await?;
            if violation.is_rejection() {
                warn!(
                    run_id = %violation.run_id,
                    level = %violation.level,
                    rule = %violation.rule,
                    violation = %violation.id,
                    "QC rejection"
                );
            } else {
                info!(
                    run_id = %violation.run_id,
                    level = %violation.level,
                    rule = %violation.rule,
                    "QC warning"
                );
            }
        }
        Ok(violations)
    }

    /// Record several results in order, collecting every violation.
    pub async fn record_all(
        &self,
        results: Vec<ControlSampleResult>,
    ) -> QcResult<Vec<QcRuleViolation>> {
        self.validate_all(&results)?;
        let mut violations = Vec::new();
        for result in results {
            violations.extend(self.record(result).await?);
        }
        Ok(violations)
    }

    pub fn levey_jennings_points(&self, level: &ControlLevelId) -> Vec<crate::LeveyJenningsPoint> {
        self.history.levey_jennings_points(level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QcConfig;
    use chrono::Utc;
    use labflow_types::{RunId, WestgardRule};

    fn service() -> (QcService, Arc<AuditLedger>) {
        let ledger = Arc::new(AuditLedger::in_memory());
        let service = QcService::new(
            QcRuleEngine::new(QcConfig::default()),
            Arc::new(QcHistory::new()),
            ledger.clone(),
        );
        (service, ledger)
    }

    #[tokio::test]
    async fn result_is_audited_before_its_violation() {
        let (service, ledger) = service();
        let run = RunId::new("r1");
        let violations = service
            .record(ControlSampleResult::new(run.clone(), "L1", 107.0, 100.0, 2.0, Utc::now()))
            .await
            .unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule, WestgardRule::OneThreeS);

        let kinds: Vec<String> = ledger
            .events(&StreamId::run(&run))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(kinds, vec!["qc_result_recorded", "qc_violation"]);
        assert_eq!(service.history().len(), 1);
    }

    #[tokio::test]
    async fn batch_with_invalid_point_records_nothing() {
        let (service, ledger) = service();
        let run = RunId::new("r1");
        let results = vec![
            ControlSampleResult::new(run.clone(), "L1", 100.0, 100.0, 2.0, Utc::now()),
            ControlSampleResult::new(run.clone(), "L2", 100.0, 100.0, -1.0, Utc::now()),
        ];
        assert!(service.record_all(results).await.is_err());
        assert!(service.history().is_empty());
        assert!(ledger.events(&StreamId::run(&run)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn later_points_see_earlier_ones() {
        let (service, _) = service();
        let run = RunId::new("r1");
        let violations = service
            .record_all(vec![
                ControlSampleResult::new(run.clone(), "L1", 104.5, 100.0, 2.0, Utc::now()),
                ControlSampleResult::new(run.clone(), "L2", 95.4, 100.0, 2.0, Utc::now()),
            ])
            .await
            .unwrap();
        let rules: Vec<WestgardRule> = violations.iter().map(|v| v.rule).collect();
        assert_eq!(rules, vec![WestgardRule::OneTwoS, WestgardRule::RFourS]);
    }
}
