//! Offline evaluation of one prompt variant against one dataset split
//!
//! Cases are independent, so they run concurrently up to a bounded
//! parallelism, each under its own wall-clock deadline. Results are gathered
//! into case-id-sorted maps before aggregation so the output is identical no
//! matter which case finished first.

use anyhow::Result;
use autotune_tracker::DatasetRow;
use chrono::{DateTime, Utc};
use dspy_rs::LM;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::agent::{simulate_case, SimulationOutcome};
use crate::llm::{activate, BudgetExhausted, LlmBudget};
use crate::scorers::{self, NOT_REACHED};

/// Whether a run covered every case or was cut short by a shutdown signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Complete,
    Cancelled,
}

/// One (variant, split) evaluation result.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VariantRun {
    pub variant_name: String,
    /// "train" or "test"
    pub split: String,
    pub dataset_ref: String,
    /// case_id -> scorer -> value; BTreeMaps keep serialization stable.
    pub per_case: BTreeMap<String, BTreeMap<String, f64>>,
    /// Aggregate scorer -> value.
    pub metrics: BTreeMap<String, f64>,
    /// For turn-count metrics: fraction of cases where the event happened.
    pub reach_rates: BTreeMap<String, f64>,
    pub avg_turn_count: f64,
    pub malformed_judge_count: u32,
    pub judge_prompt_version: String,
    #[serde(default)]
    pub experiment_ref: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub phase: RunPhase,
}

impl VariantRun {
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }
}

/// Turn-count metrics aggregate differently from binary/fraction ones.
fn is_count_metric(name: &str) -> bool {
    name.contains("turns_to")
}

/// Aggregate per-case scores into run metrics.
///
/// Binary/fraction metrics: mean over cases with a usable value; sentinel
/// scores are excluded. Count metrics: mean over cases that reached the
/// event, with the reach rate reported separately.
pub fn aggregate(
    per_case: &BTreeMap<String, BTreeMap<String, f64>>,
) -> (BTreeMap<String, f64>, BTreeMap<String, f64>) {
    let mut values_by_metric: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for scores in per_case.values() {
        for (metric, value) in scores {
            values_by_metric.entry(metric).or_default().push(*value);
        }
    }

    let mut metrics = BTreeMap::new();
    let mut reach_rates = BTreeMap::new();
    for (metric, values) in values_by_metric {
        let usable: Vec<f64> = values.iter().copied().filter(|v| *v != NOT_REACHED).collect();
        if is_count_metric(metric) {
            let total = values.len();
            reach_rates.insert(metric.to_string(), usable.len() as f64 / total.max(1) as f64);
            if !usable.is_empty() {
                metrics.insert(
                    metric.to_string(),
                    usable.iter().sum::<f64>() / usable.len() as f64,
                );
            }
        } else if !usable.is_empty() {
            metrics.insert(
                metric.to_string(),
                usable.iter().sum::<f64>() / usable.len() as f64,
            );
        }
    }
    (metrics, reach_rates)
}

enum CaseResult {
    Simulated(SimulationOutcome),
    TimedOut,
}

pub struct Evaluator {
    agent_lm: LM,
    judge_lm: LM,
    turn_limit: usize,
    parallelism: usize,
    case_timeout: Duration,
    shutdown: Arc<AtomicBool>,
}

impl Evaluator {
    pub fn new(
        agent_lm: LM,
        judge_lm: LM,
        turn_limit: usize,
        parallelism: usize,
        case_timeout: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            agent_lm,
            judge_lm,
            turn_limit,
            parallelism,
            case_timeout,
            shutdown,
        }
    }

    /// Evaluate `prompt_text` on every row of a split.
    ///
    /// Simulations run under the agent model, then scoring runs under the
    /// judge model; the active model switches only at that boundary. A
    /// budget-exhausted error aborts the whole run (the worker turns it into
    /// a WAITING tick); a shutdown signal lets in-flight cases finish and
    /// returns a partial run marked cancelled.
    pub async fn evaluate(
        &self,
        variant_name: &str,
        prompt_text: &str,
        split: &str,
        dataset_ref: &str,
        rows: &[DatasetRow],
        budget: &Arc<LlmBudget>,
    ) -> Result<VariantRun> {
        let started_at = Utc::now();
        info!(variant = variant_name, split, cases = rows.len(), "evaluating variant");

        activate(self.agent_lm.clone());
        let (outcomes, cancelled_in_sim) = self.simulate_all(prompt_text, rows, budget).await?;

        activate(self.judge_lm.clone());
        let mut per_case: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
        let mut malformed_total: u32 = 0;
        let mut turn_counts: Vec<f64> = Vec::new();

        for row in rows {
            let Some(result) = outcomes.get(&row.case_id) else {
                continue;
            };
            match result {
                CaseResult::TimedOut => {
                    warn!(case_id = %row.case_id, "case exceeded deadline, fail-scoring");
                    per_case.insert(row.case_id.clone(), scorers::timed_out_scores(row));
                }
                CaseResult::Simulated(outcome) => {
                    let mut scores = scorers::deterministic_scores(row, &outcome.transcript);
                    let judged =
                        scorers::run_judges(row.needs_emergency(), &outcome.transcript, budget)
                            .await?;
                    scores.extend(judged.values);
                    malformed_total += judged.malformed_count;
                    turn_counts.push(outcome.turn_count as f64);
                    per_case.insert(row.case_id.clone(), scores);
                }
            }
        }

        let (metrics, reach_rates) = aggregate(&per_case);
        let avg_turn_count = if turn_counts.is_empty() {
            0.0
        } else {
            turn_counts.iter().sum::<f64>() / turn_counts.len() as f64
        };

        let phase = if cancelled_in_sim || per_case.len() < rows.len() {
            RunPhase::Cancelled
        } else {
            RunPhase::Complete
        };

        Ok(VariantRun {
            variant_name: variant_name.to_string(),
            split: split.to_string(),
            dataset_ref: dataset_ref.to_string(),
            per_case,
            metrics,
            reach_rates,
            avg_turn_count,
            malformed_judge_count: malformed_total,
            judge_prompt_version: scorers::JUDGE_PROMPT_VERSION.to_string(),
            experiment_ref: None,
            started_at,
            finished_at: Utc::now(),
            phase,
        })
    }

    /// Run simulations with bounded parallelism and per-case deadlines.
    /// Returns (case_id -> result, whether a shutdown cut the run short).
    async fn simulate_all(
        &self,
        prompt_text: &str,
        rows: &[DatasetRow],
        budget: &Arc<LlmBudget>,
    ) -> Result<(BTreeMap<String, CaseResult>, bool)> {
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut handles = Vec::new();
        let mut cancelled = false;

        for row in rows {
            if self.shutdown.load(Ordering::Relaxed) {
                cancelled = true;
                break;
            }
            let permit = semaphore.clone().acquire_owned().await?;
            let prompt = prompt_text.to_string();
            let profile = row.input.simulated_user.clone();
            let case_id = row.case_id.clone();
            let turn_limit = self.turn_limit;
            let deadline = self.case_timeout;
            let budget = budget.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let result =
                    tokio::time::timeout(deadline, simulate_case(&prompt, &profile, turn_limit, &budget))
                        .await;
                let case_result = match result {
                    Err(_) => Ok(CaseResult::TimedOut),
                    Ok(Ok(outcome)) => Ok(CaseResult::Simulated(outcome)),
                    Ok(Err(err)) if err.is::<BudgetExhausted>() => Err(err),
                    Ok(Err(err)) => {
                        warn!(case_id = %case_id, error = %err, "case simulation failed, fail-scoring");
                        Ok(CaseResult::TimedOut)
                    }
                };
                (case_id, case_result)
            }));
        }

        let mut outcomes = BTreeMap::new();
        let mut budget_error: Option<anyhow::Error> = None;
        for handle in handles {
            let (case_id, result) = handle.await?;
            match result {
                Ok(case_result) => {
                    outcomes.insert(case_id, case_result);
                }
                Err(err) => budget_error = Some(err),
            }
        }
        if let Some(err) = budget_error {
            return Err(err);
        }
        Ok((outcomes, cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case_scores(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_sentinel_excluded_from_binary_mean() {
        // 10 cases; 3 judge verdicts malformed (-1). The mean covers the
        // 7 usable scores only: 5 ones and 2 zeros.
        let mut per_case = BTreeMap::new();
        for i in 0..10 {
            let value = match i {
                0..=2 => NOT_REACHED,
                3..=7 => 1.0,
                _ => 0.0,
            };
            per_case.insert(
                format!("case-{i:02}"),
                case_scores(&[("judge_calmer_end_state", value)]),
            );
        }
        let (metrics, _) = aggregate(&per_case);
        let mean = metrics["judge_calmer_end_state"];
        assert!((mean - 5.0 / 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_count_metric_reports_reach_rate() {
        let mut per_case = BTreeMap::new();
        per_case.insert(
            "a".to_string(),
            case_scores(&[("turns_to_calm_state", 3.0)]),
        );
        per_case.insert(
            "b".to_string(),
            case_scores(&[("turns_to_calm_state", 5.0)]),
        );
        per_case.insert(
            "c".to_string(),
            case_scores(&[("turns_to_calm_state", NOT_REACHED)]),
        );
        let (metrics, reach_rates) = aggregate(&per_case);
        assert!((metrics["turns_to_calm_state"] - 4.0).abs() < 1e-9);
        assert!((reach_rates["turns_to_calm_state"] - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_fully_unreached_count_metric_has_no_mean() {
        let mut per_case = BTreeMap::new();
        per_case.insert(
            "a".to_string(),
            case_scores(&[("turns_to_emergency_services", NOT_REACHED)]),
        );
        let (metrics, reach_rates) = aggregate(&per_case);
        assert!(!metrics.contains_key("turns_to_emergency_services"));
        assert_eq!(reach_rates["turns_to_emergency_services"], 0.0);
    }

    #[test]
    fn test_aggregation_is_order_independent() {
        let mut forward = BTreeMap::new();
        forward.insert("a".to_string(), case_scores(&[("m", 1.0)]));
        forward.insert("b".to_string(), case_scores(&[("m", 0.0)]));

        let mut reversed = BTreeMap::new();
        reversed.insert("b".to_string(), case_scores(&[("m", 0.0)]));
        reversed.insert("a".to_string(), case_scores(&[("m", 1.0)]));

        assert_eq!(aggregate(&forward), aggregate(&reversed));
        assert_eq!(
            serde_json::to_string(&forward).unwrap(),
            serde_json::to_string(&reversed).unwrap()
        );
    }
}
