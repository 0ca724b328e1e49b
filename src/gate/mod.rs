//! The quality gate: decide whether assessed output may proceed.
//!
//! Evaluation reads the numeric fields written by the quality-assessment
//! stage and applies a fixed priority order: insufficient material first
//! (no amount of re-ranking helps), then score/coverage thresholds, then
//! continue. A rewind recommendation is downgraded to terminal failure once
//! the rewind target has exhausted its retry budget, guaranteeing
//! termination.

use serde_json::{json, Map, Value};

use crate::state::{QualityReport, Recommendation};
use crate::workflow::{StageKind, Thresholds, WorkflowDefinition};

/// What the orchestrator should do after a quality assessment.
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    /// Advance normally.
    Continue,
    /// Rewind to `target` and apply `hint` to the accumulated fields.
    Reenter {
        target: String,
        hint: Map<String, Value>,
        reason: String,
    },
    /// Stop the pipeline: quality cannot be met within the retry budget.
    Fail { reason: String },
}

/// Evaluates quality fields and applies the retry-bounded decision rule.
#[derive(Debug, Default, Clone, Copy)]
pub struct QualityGate;

impl QualityGate {
    pub fn new() -> Self {
        Self
    }

    /// Builds a [`QualityReport`] from the fields written by a
    /// quality-assessment stage. Missing fields read as zero, which drives
    /// the report toward a rewind rather than a silent pass.
    pub fn evaluate(&self, fields: &Map<String, Value>, thresholds: &Thresholds) -> QualityReport {
        let score = fields
            .get("quality_score")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let coverage = fields
            .get("quality_coverage")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let result_count = fields
            .get("quality_result_count")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;

        // Fixed priority: material shortage beats every score signal.
        let recommendation = if result_count < thresholds.min_result_count {
            Recommendation::Reenter
        } else if score < thresholds.quality_threshold || coverage < thresholds.coverage_threshold {
            Recommendation::Reenter
        } else {
            Recommendation::Continue
        };

        QualityReport {
            score,
            coverage,
            result_count,
            recommendation,
        }
    }

    /// Turns a report into an orchestrator action, bounded by the rewind
    /// target's retry budget.
    pub fn decide(
        &self,
        report: &QualityReport,
        workflow: &WorkflowDefinition,
        target_retry_count: u32,
    ) -> GateOutcome {
        match report.recommendation {
            Recommendation::Continue => GateOutcome::Continue,
            Recommendation::Retry | Recommendation::Reenter => {
                let target = workflow
                    .stage_of_kind(StageKind::Retrieval)
                    .map(|s| s.name.clone());

                let Some(target) = target else {
                    // No retrieval stage to rewind to; treat as terminal.
                    return GateOutcome::Fail {
                        reason: "quality below threshold and no retrieval stage to re-enter"
                            .to_string(),
                    };
                };

                if target_retry_count >= workflow.thresholds.max_retries {
                    return GateOutcome::Fail {
                        reason: format!(
                            "insufficient quality after {} retries (score {:.2}, coverage {:.2}, {} results)",
                            target_retry_count, report.score, report.coverage, report.result_count
                        ),
                    };
                }

                let reason = if report.result_count < workflow.thresholds.min_result_count {
                    format!(
                        "only {} results, need at least {}",
                        report.result_count, workflow.thresholds.min_result_count
                    )
                } else {
                    format!(
                        "score {:.2} or coverage {:.2} below thresholds",
                        report.score, report.coverage
                    )
                };

                // Broaden the retrieval strategy on re-entry.
                let mut hint = Map::new();
                hint.insert("retrieval_strategy".to_string(), json!("broad"));

                GateOutcome::Reenter {
                    target,
                    hint,
                    reason,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::TaskType;
    use crate::workflow::WorkflowComposer;

    fn workflow() -> WorkflowDefinition {
        WorkflowComposer::new(Thresholds::default())
            .unwrap()
            .compose(TaskType::Explanation)
            .unwrap()
    }

    fn quality_fields(score: f64, coverage: f64, count: u64) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("quality_score".into(), json!(score));
        fields.insert("quality_coverage".into(), json!(coverage));
        fields.insert("quality_result_count".into(), json!(count));
        fields
    }

    #[test]
    fn test_good_output_continues() {
        let gate = QualityGate::new();
        let report = gate.evaluate(&quality_fields(0.8, 0.9, 5), &Thresholds::default());
        assert_eq!(report.recommendation, Recommendation::Continue);
        assert_eq!(gate.decide(&report, &workflow(), 0), GateOutcome::Continue);
    }

    #[test]
    fn test_result_count_has_priority_over_score() {
        // A perfect score cannot rescue insufficient material.
        let gate = QualityGate::new();
        let report = gate.evaluate(&quality_fields(1.0, 1.0, 1), &Thresholds::default());
        assert_eq!(report.recommendation, Recommendation::Reenter);
    }

    #[test]
    fn test_low_score_reenters() {
        let gate = QualityGate::new();
        let report = gate.evaluate(&quality_fields(0.3, 0.9, 5), &Thresholds::default());
        assert_eq!(report.recommendation, Recommendation::Reenter);
    }

    #[test]
    fn test_low_coverage_reenters() {
        let gate = QualityGate::new();
        let report = gate.evaluate(&quality_fields(0.9, 0.2, 5), &Thresholds::default());
        assert_eq!(report.recommendation, Recommendation::Reenter);
    }

    #[test]
    fn test_missing_fields_read_as_zero() {
        let gate = QualityGate::new();
        let report = gate.evaluate(&Map::new(), &Thresholds::default());
        assert_eq!(report.result_count, 0);
        assert_eq!(report.recommendation, Recommendation::Reenter);
    }

    #[test]
    fn test_reenter_targets_retrieval_with_broad_hint() {
        let gate = QualityGate::new();
        let report = gate.evaluate(&quality_fields(0.1, 0.1, 5), &Thresholds::default());

        match gate.decide(&report, &workflow(), 0) {
            GateOutcome::Reenter { target, hint, .. } => {
                assert_eq!(target, "retrieval");
                assert_eq!(hint["retrieval_strategy"], json!("broad"));
            }
            other => panic!("expected reenter, got {:?}", other),
        }
    }

    #[test]
    fn test_exhausted_retries_downgrade_to_fail() {
        let gate = QualityGate::new();
        let report = gate.evaluate(&quality_fields(0.0, 0.0, 0), &Thresholds::default());

        let wf = workflow();
        assert!(matches!(
            gate.decide(&report, &wf, wf.thresholds.max_retries),
            GateOutcome::Fail { .. }
        ));
    }

    #[test]
    fn test_fail_reason_mentions_retry_exhaustion() {
        let gate = QualityGate::new();
        let report = gate.evaluate(&quality_fields(0.0, 0.0, 0), &Thresholds::default());
        let wf = workflow();

        if let GateOutcome::Fail { reason } = gate.decide(&report, &wf, 2) {
            assert!(reason.contains("insufficient quality after 2 retries"));
        } else {
            panic!("expected fail");
        }
    }
}
