//! Promotion gate
//!
//! A candidate replaces the baseline prompt only when it clears the primary
//! delta on the test split without giving back too much on the secondary
//! metric, and the same comparison holds on the train split. Everything here
//! is pure; the worker does the publishing and persists the decision.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::evaluator::VariantRun;
use crate::scorers::METRIC_JUDGE_TURNS_TO_CALM;

/// Thresholds and metric names the gate runs with; recorded verbatim in
/// every decision artifact.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GateConfig {
    pub min_delta_primary: f64,
    pub min_delta_primary_train: f64,
    pub max_regression_secondary: f64,
    pub primary_metric: String,
    pub secondary_metric: String,
}

/// Result of comparing one candidate against the baseline on one split.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GateCheck {
    pub passed: bool,
    pub delta_primary: f64,
    pub delta_secondary: f64,
    pub reason: String,
}

fn metric_or_zero(run: &VariantRun, name: &str) -> f64 {
    run.metric(name).unwrap_or(0.0)
}

/// Compare a candidate to the baseline under one primary-delta threshold.
pub fn check_gate(
    baseline: &VariantRun,
    candidate: &VariantRun,
    min_delta_primary: f64,
    config: &GateConfig,
) -> GateCheck {
    let delta_primary = metric_or_zero(candidate, &config.primary_metric)
        - metric_or_zero(baseline, &config.primary_metric);
    let delta_secondary = metric_or_zero(candidate, &config.secondary_metric)
        - metric_or_zero(baseline, &config.secondary_metric);

    // The primary metric must be strictly better, by at least the threshold.
    let primary_ok = delta_primary > 0.0 && delta_primary >= min_delta_primary;
    let secondary_ok = delta_secondary >= -config.max_regression_secondary;

    let reason = if primary_ok && secondary_ok {
        format!(
            "{} improved by {delta_primary:+.4} (threshold {min_delta_primary:.4}); {} moved {delta_secondary:+.4} (within tolerance {:.4})",
            config.primary_metric, config.secondary_metric, config.max_regression_secondary
        )
    } else if !primary_ok {
        format!(
            "{} delta {delta_primary:+.4} below required {min_delta_primary:.4}",
            config.primary_metric
        )
    } else {
        format!(
            "{} regressed by {:.4}, exceeding the allowed {:.4}",
            config.secondary_metric,
            -delta_secondary,
            config.max_regression_secondary
        )
    };

    GateCheck {
        passed: primary_ok && secondary_ok,
        delta_primary,
        delta_secondary,
        reason,
    }
}

/// Ranking key for winner selection: primary, then secondary, then fewer
/// turns to a calm caller. A missing turn metric ranks worst.
fn score_tuple(run: &VariantRun, config: &GateConfig) -> (f64, f64, f64) {
    let turns = run.metric(METRIC_JUDGE_TURNS_TO_CALM).unwrap_or(999.0);
    (
        metric_or_zero(run, &config.primary_metric),
        metric_or_zero(run, &config.secondary_metric),
        -turns,
    )
}

/// Among the candidates that pass the test gate, pick the best by the
/// ranking tuple. An exact tie all the way through means no winner and the
/// baseline is retained.
pub fn pick_test_winner<'a>(
    baseline: &VariantRun,
    candidates: &'a [VariantRun],
    config: &GateConfig,
) -> Option<&'a VariantRun> {
    let mut passers: Vec<&VariantRun> = candidates
        .iter()
        .filter(|c| check_gate(baseline, c, config.min_delta_primary, config).passed)
        .collect();
    if passers.is_empty() {
        return None;
    }
    passers.sort_by(|a, b| {
        score_tuple(b, config)
            .partial_cmp(&score_tuple(a, config))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    if passers.len() >= 2 && score_tuple(passers[0], config) == score_tuple(passers[1], config) {
        return None;
    }
    Some(passers[0])
}

/// Baseline-vs-candidate comparison on one split, as persisted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SplitComparison {
    pub split: String,
    pub baseline_metrics: BTreeMap<String, f64>,
    pub candidate_metrics: BTreeMap<String, f64>,
    pub check: GateCheck,
    pub min_delta_primary: f64,
}

impl SplitComparison {
    pub fn new(
        split: &str,
        baseline: &VariantRun,
        candidate: &VariantRun,
        min_delta_primary: f64,
        config: &GateConfig,
    ) -> Self {
        Self {
            split: split.to_string(),
            baseline_metrics: baseline.metrics.clone(),
            candidate_metrics: candidate.metrics.clone(),
            check: check_gate(baseline, candidate, min_delta_primary, config),
            min_delta_primary,
        }
    }
}

/// The run's `promotion_decision.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PromotionDecision {
    pub run: String,
    pub promoted: bool,
    #[serde(default)]
    pub winner: Option<String>,
    pub reason: String,
    /// Hash in production when the decision was made.
    pub prior_hash: String,
    /// Hash that went live; only set when `promoted` is true.
    #[serde(default)]
    pub new_hash: Option<String>,
    pub thresholds: GateConfig,
    #[serde(default)]
    pub test: Option<SplitComparison>,
    #[serde(default)]
    pub train: Option<SplitComparison>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::RunPhase;
    use chrono::Utc;

    fn run(name: &str, split: &str, calmer: f64, emergency: f64) -> VariantRun {
        let mut metrics = BTreeMap::new();
        metrics.insert("judge_calmer_end_state".to_string(), calmer);
        metrics.insert("judge_emergency_services_when_needed".to_string(), emergency);
        VariantRun {
            variant_name: name.to_string(),
            split: split.to_string(),
            dataset_ref: "crisis-calls".to_string(),
            per_case: BTreeMap::new(),
            metrics,
            reach_rates: BTreeMap::new(),
            avg_turn_count: 6.0,
            malformed_judge_count: 0,
            judge_prompt_version: "crisis-judge-v2".to_string(),
            experiment_ref: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            phase: RunPhase::Complete,
        }
    }

    fn config() -> GateConfig {
        GateConfig {
            min_delta_primary: 0.10,
            min_delta_primary_train: 0.05,
            max_regression_secondary: 0.05,
            primary_metric: "judge_calmer_end_state".to_string(),
            secondary_metric: "judge_emergency_services_when_needed".to_string(),
        }
    }

    #[test]
    fn test_clear_win_both_splits() {
        let config = config();
        let baseline_test = run("baseline", "test", 0.20, 0.40);
        let variant_a = run("variant_1", "test", 0.55, 0.50);
        let variant_b = run("variant_2", "test", 0.30, 0.60);

        let winner =
            pick_test_winner(&baseline_test, &[variant_a.clone(), variant_b], &config).unwrap();
        assert_eq!(winner.variant_name, "variant_1");

        let check = check_gate(&baseline_test, &variant_a, config.min_delta_primary, &config);
        assert!(check.passed);
        assert!((check.delta_primary - 0.35).abs() < 1e-9);
        assert!((check.delta_secondary - 0.10).abs() < 1e-9);

        // Train split still clears the (looser) train threshold.
        let baseline_train = run("baseline", "train", 0.20, 0.40);
        let winner_train = run("variant_1", "train", 0.52, 0.48);
        let train_check = check_gate(
            &baseline_train,
            &winner_train,
            config.min_delta_primary_train,
            &config,
        );
        assert!(train_check.passed);
        assert!((train_check.delta_primary - 0.32).abs() < 1e-9);
    }

    #[test]
    fn test_secondary_regression_blocks() {
        let config = config();
        let baseline = run("baseline", "test", 0.20, 0.80);
        let candidate = run("variant_1", "test", 0.40, 0.60);

        let check = check_gate(&baseline, &candidate, config.min_delta_primary, &config);
        assert!(!check.passed);
        assert!(check.reason.contains("judge_emergency_services_when_needed"));
        assert!(check.reason.contains("regressed"));

        assert!(pick_test_winner(&baseline, &[candidate], &config).is_none());
    }

    #[test]
    fn test_small_primary_gain_blocks() {
        let config = config();
        let baseline = run("baseline", "test", 0.20, 0.40);
        let candidate = run("variant_1", "test", 0.25, 0.45);
        let check = check_gate(&baseline, &candidate, config.min_delta_primary, &config);
        assert!(!check.passed);
        assert!(check.reason.contains("below required"));
    }

    #[test]
    fn test_exact_tie_means_no_winner() {
        let config = config();
        let baseline = run("baseline", "test", 0.20, 0.40);
        let a = run("variant_1", "test", 0.55, 0.50);
        let b = run("variant_2", "test", 0.55, 0.50);
        assert!(pick_test_winner(&baseline, &[a, b], &config).is_none());
    }

    #[test]
    fn test_turns_tiebreak_picks_faster_calm() {
        let config = config();
        let baseline = run("baseline", "test", 0.20, 0.40);
        let mut a = run("variant_1", "test", 0.55, 0.50);
        let mut b = run("variant_2", "test", 0.55, 0.50);
        a.metrics.insert(METRIC_JUDGE_TURNS_TO_CALM.to_string(), 3.0);
        b.metrics.insert(METRIC_JUDGE_TURNS_TO_CALM.to_string(), 5.0);
        let winner = pick_test_winner(&baseline, &[a, b], &config).unwrap();
        assert_eq!(winner.variant_name, "variant_1");
    }
}
