//! Autotune worker
//!
//! One cooperative loop, one durable state transition per tick. Each phase
//! handler reads its inputs from the run directory rather than from memory,
//! so a crash between ticks resumes exactly where the artifacts say the run
//! stopped.

use anyhow::Result;
use autotune_tracker::{datasets::split_rows, DatasetRow, TrackerClient, TrackerError};
use chrono::Utc;
use dspy_rs::LM;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::artifacts::{
    self, RunStore, StatusSnapshot, DECISION_FILE, FINDINGS_FILE, SOURCE_TRACES_FILE,
    VARIANT_RUNS_FILE,
};
use crate::config::Config;
use crate::evaluator::{Evaluator, RunPhase, VariantRun};
use crate::llm::{activate, BudgetExhausted, LlmBudget};
use crate::promotion::{
    check_gate, pick_test_winner, GateConfig, PromotionDecision, SplitComparison,
};
use crate::proposer::{content_hash, FindingsAndVariants, Proposer, SEED_PROMPT};
use crate::snapshot::{build_snapshot, TraceSnapshot};
use crate::state::{ErrorKind, LoopState, Phase, TickOutcome};

/// Name the baseline prompt runs under in every artifact.
pub const BASELINE_NAME: &str = "baseline";

/// Tick-internal error classification; decides what the next state is.
#[derive(Debug, thiserror::Error)]
enum TickError {
    #[error("transient external failure: {0}")]
    Transient(#[source] anyhow::Error),
    #[error("rate limited")]
    RateLimited,
    #[error("artifact failure: {0}")]
    Artifact(#[source] anyhow::Error),
}

fn tracker_err(err: TrackerError) -> TickError {
    if err.is_rate_limit() {
        TickError::RateLimited
    } else {
        TickError::Transient(err.into())
    }
}

fn llm_err(err: anyhow::Error) -> TickError {
    if err.is::<BudgetExhausted>() {
        TickError::RateLimited
    } else {
        TickError::Transient(err)
    }
}

fn artifact_err(err: anyhow::Error) -> TickError {
    TickError::Artifact(err)
}

/// Replace-or-append runs, keyed by (variant_name, split). Re-running a
/// phase after a crash or cancellation overwrites its earlier partial rows
/// instead of duplicating them.
fn upsert_runs(mut existing: Vec<VariantRun>, new: Vec<VariantRun>) -> Vec<VariantRun> {
    for run in new {
        match existing
            .iter()
            .position(|r| r.variant_name == run.variant_name && r.split == run.split)
        {
            Some(idx) => existing[idx] = run,
            None => existing.push(run),
        }
    }
    existing
}

pub struct Worker {
    config: Config,
    tracker: TrackerClient,
    store: RunStore,
    state: LoopState,
    /// Reflection and variant generation run on the judge model; the agent
    /// model lives inside the evaluator.
    judge_lm: LM,
    evaluator: Evaluator,
    shutdown: Arc<AtomicBool>,
    dataset_cache: Option<(Vec<DatasetRow>, Vec<DatasetRow>)>,
    consecutive_failures: u32,
}

impl Worker {
    pub fn new(
        config: Config,
        tracker: TrackerClient,
        store: RunStore,
        agent_lm: LM,
        judge_lm: LM,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let state = LoopState::load_or_default(&store.state_file());
        if state.current_phase.is_mid_run() {
            info!(phase = state.current_phase.as_str(), "resuming mid-run after restart");
        }
        let evaluator = Evaluator::new(
            agent_lm,
            judge_lm.clone(),
            config.turn_limit,
            config.eval_parallelism,
            Duration::from_secs(config.case_timeout_seconds),
            shutdown.clone(),
        );
        Self {
            config,
            tracker,
            store,
            state,
            judge_lm,
            evaluator,
            shutdown,
            dataset_cache: None,
            consecutive_failures: 0,
        }
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    /// True once transient failures have persisted long enough that the
    /// process should exit with code 3.
    pub fn persistent_failure(&self) -> bool {
        self.consecutive_failures >= self.config.max_consecutive_failures
    }

    fn gate_config(&self) -> GateConfig {
        GateConfig {
            min_delta_primary: self.config.min_delta_primary,
            min_delta_primary_train: self.config.min_delta_primary_train,
            max_regression_secondary: self.config.max_regression_secondary,
            primary_metric: self.config.primary_metric.clone(),
            secondary_metric: self.config.secondary_metric.clone(),
        }
    }

    /// Advance the state machine by at most one transition.
    pub async fn tick(&mut self) -> TickOutcome {
        if self.shutdown.load(Ordering::Relaxed) {
            return TickOutcome::Waited("shutdown".to_string());
        }

        let budget = Arc::new(LlmBudget::new(self.config.llm_budget_per_tick));
        let phase = self.state.current_phase;
        let result = match phase {
            p if p.is_restartable() || p == Phase::Polling => self.poll_and_snapshot().await,
            Phase::SnapshotBuilt => self.generate_strategies(&budget).await,
            Phase::StrategiesGenerated => self.eval_test(&budget).await,
            Phase::EvalTest => self.decide_test(&budget).await,
            Phase::EvalTrain => self.decide_train().await,
            Phase::Promoted => self.finish_cycle(),
            // is_restartable covers the rest; keep the compiler honest.
            _ => self.poll_and_snapshot().await,
        };

        match result {
            Ok(outcome) => {
                self.consecutive_failures = 0;
                outcome
            }
            Err(TickError::RateLimited) => {
                warn!("tick rate limited, backing off until next poll");
                if let Err(err) = self.transition(Phase::Waiting, Some("rate_limited".to_string()))
                {
                    error!(error = %err, "failed to persist waiting state");
                }
                TickOutcome::Waited("rate_limited".to_string())
            }
            Err(TickError::Transient(err)) => {
                self.consecutive_failures += 1;
                warn!(
                    error = %err,
                    consecutive = self.consecutive_failures,
                    "transient failure, state unchanged, retrying next tick"
                );
                TickOutcome::Errored(ErrorKind::TransientExternal)
            }
            Err(TickError::Artifact(err)) => {
                error!(error = %err, "artifact failure, quarantining run");
                if let Some(run_dir) = self.state.current_run_dir.clone() {
                    artifacts::quarantine(&run_dir);
                }
                self.state.current_run_dir = None;
                if let Err(save_err) =
                    self.transition(Phase::Errored, Some(format!("artifact failure: {err}")))
                {
                    error!(error = %save_err, "failed to persist errored state");
                }
                TickOutcome::Errored(ErrorKind::ArtifactSchema)
            }
        }
    }

    /// Persist a phase change and refresh the dashboard snapshot. Durable
    /// before the tick returns.
    fn transition(&mut self, phase: Phase, reason: Option<String>) -> Result<()> {
        self.state.current_phase = phase;
        self.state.updated_at = Utc::now();
        self.state.save(&self.store.state_file())?;

        let current_run = self
            .state
            .current_run_dir
            .as_ref()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .map(String::from);
        self.store.write_status(&StatusSnapshot {
            phase,
            reason,
            updated_at: self.state.updated_at,
            new_trace_count: self.state.pending_trace_count,
            current_run,
            promoted_prompt_hash: self.state.promoted_prompt_hash.clone(),
        })?;
        info!(phase = phase.as_str(), "state transition");
        Ok(())
    }

    /// Fetch and cache the dataset rows; `(name, version)` is immutable on
    /// the tracker, so one fetch per process is enough.
    async fn ensure_dataset(&mut self) -> Result<(), TickError> {
        if self.dataset_cache.is_none() {
            let rows = self
                .tracker
                .fetch_dataset(
                    &self.config.dataset_name,
                    self.config.dataset_version.as_deref(),
                )
                .await
                .map_err(tracker_err)?;
            let (train, test) = split_rows(rows);
            info!(train = train.len(), test = test.len(), "dataset loaded");
            self.dataset_cache = Some((train, test));
        }
        Ok(())
    }

    /// The prompt the live agent is currently running, from the registry,
    /// or the seed prompt before any promotion has happened.
    async fn current_prompt(&self) -> Result<String, TickError> {
        match self.tracker.fetch_current_prompt().await.map_err(tracker_err)? {
            Some(record) => Ok(record.text),
            None => Ok(SEED_PROMPT.to_string()),
        }
    }

    fn run_dir(&self) -> Result<PathBuf, TickError> {
        self.state
            .current_run_dir
            .clone()
            .ok_or_else(|| artifact_err(anyhow::anyhow!("mid-run phase without a run directory")))
    }

    fn run_stamp(&self) -> String {
        self.state
            .current_run_dir
            .as_ref()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string()
    }

    // ------------------------------------------------------------------
    // Phase handlers
    // ------------------------------------------------------------------

    async fn poll_and_snapshot(&mut self) -> Result<TickOutcome, TickError> {
        let cursor = self.state.last_trace_cursor;
        let traces = self
            .tracker
            .fetch_traces_since(cursor, self.config.source_experiment.as_deref())
            .await
            .map_err(tracker_err)?;
        self.ensure_dataset().await?;
        let (train_rows, test_rows) = self.dataset_cache.as_ref().expect("dataset cached");

        let snapshot = build_snapshot(cursor, traces, train_rows, test_rows);
        let new_trace_count = snapshot.as_ref().map(|s| s.trace_count).unwrap_or(0);
        self.state.pending_trace_count = new_trace_count;

        let Some(snapshot) = snapshot.filter(|s| s.trace_count >= self.config.min_batch) else {
            let reason = format!(
                "insufficient new traces: {} < {}",
                new_trace_count, self.config.min_batch
            );
            info!(new_trace_count, min_batch = self.config.min_batch, "waiting for more traces");
            self.transition(Phase::Waiting, Some(reason.clone()))
                .map_err(artifact_err)?;
            return Ok(TickOutcome::Waited(reason));
        };

        let run_dir = self
            .store
            .create_run_dir(Utc::now())
            .map_err(artifact_err)?;
        artifacts::write_json_atomic(&run_dir.join(SOURCE_TRACES_FILE), &snapshot)
            .map_err(artifact_err)?;

        info!(
            run = %run_dir.display(),
            traces = snapshot.trace_count,
            "snapshot frozen, cursor advanced"
        );
        self.state.last_trace_cursor = Some(snapshot.cursor_end);
        self.state.current_run_dir = Some(run_dir);
        self.transition(Phase::SnapshotBuilt, None)
            .map_err(artifact_err)?;
        Ok(TickOutcome::Progressed)
    }

    async fn generate_strategies(&mut self, budget: &Arc<LlmBudget>) -> Result<TickOutcome, TickError> {
        let run_dir = self.run_dir()?;
        let snapshot: TraceSnapshot =
            artifacts::read_json(&run_dir.join(SOURCE_TRACES_FILE)).map_err(artifact_err)?;
        let current_prompt = self.current_prompt().await?;

        // Reflection and proposal both run on the judge model, the same way
        // the optimizer splits roles: the agent model is what gets tested,
        // the judge model is what does the thinking about it.
        activate(self.judge_lm.clone());
        let proposer = Proposer {
            variant_count: 2,
            effective_temperature: 0.9,
            seed: self.config.seed,
            generator_model: self.config.judge_model.clone(),
        };
        let findings = proposer
            .propose(&snapshot.traces, &current_prompt, budget)
            .await
            .map_err(llm_err)?;

        artifacts::write_json_atomic(&run_dir.join(FINDINGS_FILE), &findings)
            .map_err(artifact_err)?;
        info!(
            variants = findings.variants.len(),
            findings = findings.findings.len(),
            "strategies generated"
        );
        self.transition(Phase::StrategiesGenerated, None)
            .map_err(artifact_err)?;
        Ok(TickOutcome::Progressed)
    }

    async fn eval_test(&mut self, budget: &Arc<LlmBudget>) -> Result<TickOutcome, TickError> {
        let run_dir = self.run_dir()?;
        let findings: FindingsAndVariants =
            artifacts::read_json(&run_dir.join(FINDINGS_FILE)).map_err(artifact_err)?;

        self.ensure_dataset().await?;
        let test_rows = self.dataset_cache.as_ref().expect("dataset cached").1.clone();
        if test_rows.is_empty() {
            return self.write_decision_and_complete(
                None,
                "dataset has no test split; promotion requires one".to_string(),
                None,
                None,
            );
        }

        let baseline_prompt = self.current_prompt().await?;
        let mut prompts: Vec<(String, String)> =
            vec![(BASELINE_NAME.to_string(), baseline_prompt)];
        for variant in &findings.variants {
            prompts.push((variant.name.clone(), variant.text.clone()));
        }

        let cancelled = self
            .run_evaluations(&prompts, "test", &test_rows, budget)
            .await?;
        if cancelled {
            return Ok(TickOutcome::Waited("shutdown".to_string()));
        }

        self.transition(Phase::EvalTest, None).map_err(artifact_err)?;
        Ok(TickOutcome::Progressed)
    }

    async fn decide_test(&mut self, budget: &Arc<LlmBudget>) -> Result<TickOutcome, TickError> {
        let run_dir = self.run_dir()?;
        let runs: Vec<VariantRun> =
            artifacts::read_json(&run_dir.join(VARIANT_RUNS_FILE)).map_err(artifact_err)?;
        let gate = self.gate_config();

        let baseline = runs
            .iter()
            .find(|r| r.variant_name == BASELINE_NAME && r.split == "test")
            .cloned()
            .ok_or_else(|| artifact_err(anyhow::anyhow!("missing baseline test run")))?;
        let candidates: Vec<VariantRun> = runs
            .iter()
            .filter(|r| {
                r.variant_name != BASELINE_NAME && r.split == "test" && r.phase == RunPhase::Complete
            })
            .cloned()
            .collect();

        let Some(winner) = pick_test_winner(&baseline, &candidates, &gate).cloned() else {
            let best_comparison = candidates.first().map(|c| {
                SplitComparison::new("test", &baseline, c, gate.min_delta_primary, &gate)
            });
            return self.write_decision_and_complete(
                None,
                "no variant cleared the test gate".to_string(),
                best_comparison,
                None,
            );
        };
        info!(winner = %winner.variant_name, "test gate passed, evaluating train split");

        self.ensure_dataset().await?;
        let train_rows = self.dataset_cache.as_ref().expect("dataset cached").0.clone();
        if train_rows.is_empty() {
            let comparison = SplitComparison::new(
                "test",
                &baseline,
                &winner,
                gate.min_delta_primary,
                &gate,
            );
            return self.write_decision_and_complete(
                Some(winner.variant_name.clone()),
                "dataset has no train split; promotion requires one".to_string(),
                Some(comparison),
                None,
            );
        }

        let findings: FindingsAndVariants =
            artifacts::read_json(&run_dir.join(FINDINGS_FILE)).map_err(artifact_err)?;
        let winner_text = findings
            .variants
            .iter()
            .find(|v| v.name == winner.variant_name)
            .map(|v| v.text.clone())
            .ok_or_else(|| artifact_err(anyhow::anyhow!("winner missing from findings artifact")))?;
        let baseline_prompt = self.current_prompt().await?;

        let prompts = vec![
            (BASELINE_NAME.to_string(), baseline_prompt),
            (winner.variant_name.clone(), winner_text),
        ];
        let cancelled = self
            .run_evaluations(&prompts, "train", &train_rows, budget)
            .await?;
        if cancelled {
            return Ok(TickOutcome::Waited("shutdown".to_string()));
        }

        self.transition(Phase::EvalTrain, None).map_err(artifact_err)?;
        Ok(TickOutcome::Progressed)
    }

    async fn decide_train(&mut self) -> Result<TickOutcome, TickError> {
        let run_dir = self.run_dir()?;
        let runs: Vec<VariantRun> =
            artifacts::read_json(&run_dir.join(VARIANT_RUNS_FILE)).map_err(artifact_err)?;
        let gate = self.gate_config();

        let find = |name_is_baseline: bool, split: &str| {
            runs.iter()
                .find(|r| (r.variant_name == BASELINE_NAME) == name_is_baseline && r.split == split)
                .cloned()
        };
        let baseline_test = find(true, "test")
            .ok_or_else(|| artifact_err(anyhow::anyhow!("missing baseline test run")))?;
        let baseline_train = find(true, "train")
            .ok_or_else(|| artifact_err(anyhow::anyhow!("missing baseline train run")))?;
        let winner_train = find(false, "train")
            .ok_or_else(|| artifact_err(anyhow::anyhow!("missing winner train run")))?;
        let winner_test = runs
            .iter()
            .find(|r| r.variant_name == winner_train.variant_name && r.split == "test")
            .cloned()
            .ok_or_else(|| artifact_err(anyhow::anyhow!("missing winner test run")))?;

        let test_comparison = SplitComparison::new(
            "test",
            &baseline_test,
            &winner_test,
            gate.min_delta_primary,
            &gate,
        );
        let train_comparison = SplitComparison::new(
            "train",
            &baseline_train,
            &winner_train,
            gate.min_delta_primary_train,
            &gate,
        );

        let train_check = check_gate(
            &baseline_train,
            &winner_train,
            gate.min_delta_primary_train,
            &gate,
        );
        if !train_check.passed {
            return self.write_decision_and_complete(
                Some(winner_train.variant_name.clone()),
                format!("train gate failed: {}", train_check.reason),
                Some(test_comparison),
                Some(train_comparison),
            );
        }

        // Both gates hold; publish (when enabled) and record the decision.
        let findings: FindingsAndVariants =
            artifacts::read_json(&run_dir.join(FINDINGS_FILE)).map_err(artifact_err)?;
        let winner_variant = findings
            .variants
            .iter()
            .find(|v| v.name == winner_train.variant_name)
            .ok_or_else(|| artifact_err(anyhow::anyhow!("winner missing from findings artifact")))?;

        if self.config.update_live_prompt {
            let mut metadata: BTreeMap<String, serde_json::Value> = BTreeMap::new();
            metadata.insert("run".to_string(), self.run_stamp().into());
            metadata.insert("parent_hash".to_string(), winner_variant.parent_hash.clone().into());
            metadata.insert("rationale".to_string(), winner_variant.rationale.clone().into());
            if let Err(err) = self
                .tracker
                .publish_prompt(&winner_variant.hash, &winner_variant.text, &metadata)
                .await
            {
                // The gate passed but the outside world refused the write:
                // the old hash stays current and the decision records why.
                warn!(error = %err, "prompt publish failed, keeping baseline");
                return self.write_decision_and_complete(
                    Some(winner_train.variant_name.clone()),
                    format!("publish_failed: {err}"),
                    Some(test_comparison),
                    Some(train_comparison),
                );
            }
        }

        let decision = PromotionDecision {
            run: self.run_stamp(),
            promoted: true,
            winner: Some(winner_train.variant_name.clone()),
            reason: format!(
                "test: {}; train: {}",
                test_comparison.check.reason, train_check.reason
            ),
            prior_hash: winner_variant.parent_hash.clone(),
            new_hash: Some(winner_variant.hash.clone()),
            thresholds: gate,
            test: Some(test_comparison),
            train: Some(train_comparison),
        };
        artifacts::write_json_atomic(&run_dir.join(DECISION_FILE), &decision)
            .map_err(artifact_err)?;

        self.state.promoted_prompt_hash = Some(winner_variant.hash.clone());
        info!(
            winner = %winner_train.variant_name,
            hash = %winner_variant.hash,
            published = self.config.update_live_prompt,
            "variant promoted"
        );
        self.transition(Phase::Promoted, Some(decision.reason))
            .map_err(artifact_err)?;
        Ok(TickOutcome::Progressed)
    }

    fn finish_cycle(&mut self) -> Result<TickOutcome, TickError> {
        self.transition(Phase::CycleComplete, None)
            .map_err(artifact_err)?;
        Ok(TickOutcome::Progressed)
    }

    // ------------------------------------------------------------------
    // Shared pieces
    // ------------------------------------------------------------------

    /// Evaluate each (name, prompt) pair on one split and upsert the runs
    /// into `variant_runs.json`. Returns true when a shutdown cut the work
    /// short; partial runs are still persisted, marked cancelled.
    async fn run_evaluations(
        &mut self,
        prompts: &[(String, String)],
        split: &str,
        rows: &[DatasetRow],
        budget: &Arc<LlmBudget>,
    ) -> Result<bool, TickError> {
        let run_dir = self.run_dir()?;
        let stamp = self.run_stamp();
        let mut new_runs: Vec<VariantRun> = Vec::new();
        let mut cancelled = false;

        for (name, prompt_text) in prompts {
            let mut run = self
                .evaluator
                .evaluate(
                    name,
                    prompt_text,
                    split,
                    &self.config.dataset_name,
                    rows,
                    budget,
                )
                .await
                .map_err(llm_err)?;

            let experiment_name = format!("{stamp}-{name}-{split}");
            let rows_payload = serde_json::to_value(&run.per_case)
                .map_err(|e| artifact_err(e.into()))?;
            match self
                .tracker
                .write_experiment(&experiment_name, name, split, &rows_payload)
                .await
            {
                Ok(experiment_ref) => run.experiment_ref = Some(experiment_ref),
                Err(err) => return Err(tracker_err(err)),
            }

            if run.phase == RunPhase::Cancelled {
                cancelled = true;
                new_runs.push(run);
                break;
            }
            new_runs.push(run);
            if self.shutdown.load(Ordering::Relaxed) {
                cancelled = true;
                break;
            }
        }

        let existing: Vec<VariantRun> = if run_dir.join(VARIANT_RUNS_FILE).exists() {
            artifacts::read_json(&run_dir.join(VARIANT_RUNS_FILE)).map_err(artifact_err)?
        } else {
            Vec::new()
        };
        let merged = upsert_runs(existing, new_runs);
        artifacts::write_json_atomic(&run_dir.join(VARIANT_RUNS_FILE), &merged)
            .map_err(artifact_err)?;
        Ok(cancelled)
    }

    /// Write a no-promotion decision and close the cycle.
    fn write_decision_and_complete(
        &mut self,
        winner: Option<String>,
        reason: String,
        test: Option<SplitComparison>,
        train: Option<SplitComparison>,
    ) -> Result<TickOutcome, TickError> {
        let run_dir = self.run_dir()?;
        let decision = PromotionDecision {
            run: self.run_stamp(),
            promoted: false,
            winner,
            reason: reason.clone(),
            prior_hash: self
                .state
                .promoted_prompt_hash
                .clone()
                .unwrap_or_else(|| content_hash(SEED_PROMPT)),
            new_hash: None,
            thresholds: self.gate_config(),
            test,
            train,
        };
        artifacts::write_json_atomic(&run_dir.join(DECISION_FILE), &decision)
            .map_err(artifact_err)?;
        info!(reason = %reason, "cycle complete without promotion");
        self.transition(Phase::CycleComplete, Some(reason))
            .map_err(artifact_err)?;
        Ok(TickOutcome::Progressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn run(name: &str, split: &str) -> VariantRun {
        VariantRun {
            variant_name: name.to_string(),
            split: split.to_string(),
            dataset_ref: "d".to_string(),
            per_case: BTreeMap::new(),
            metrics: BTreeMap::new(),
            reach_rates: BTreeMap::new(),
            avg_turn_count: 0.0,
            malformed_judge_count: 0,
            judge_prompt_version: "v".to_string(),
            experiment_ref: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            phase: RunPhase::Complete,
        }
    }

    #[test]
    fn test_upsert_replaces_same_variant_and_split() {
        let existing = vec![run("baseline", "test"), run("variant_1", "test")];
        let mut replacement = run("variant_1", "test");
        replacement.avg_turn_count = 9.0;

        let merged = upsert_runs(existing, vec![replacement, run("baseline", "train")]);
        assert_eq!(merged.len(), 3);
        let replaced = merged
            .iter()
            .find(|r| r.variant_name == "variant_1" && r.split == "test")
            .unwrap();
        assert_eq!(replaced.avg_turn_count, 9.0);
    }

    #[test]
    fn test_no_duplicate_variant_split_pairs() {
        let merged = upsert_runs(
            vec![run("baseline", "test")],
            vec![run("baseline", "test"), run("baseline", "test")],
        );
        assert_eq!(merged.len(), 1);
    }
}
