use anyhow::{Context, Result};
use std::path::PathBuf;

/// Process configuration, read once at startup.
///
/// Missing required keys or out-of-range thresholds fail fast; the binary
/// exits with code 2 before the worker ever ticks.
#[derive(Debug, Clone)]
pub struct Config {
    /// Logical project name for trace/dataset scoping on the tracker.
    pub project: String,
    /// Optional source experiment bucket; empty means all traces.
    pub source_experiment: Option<String>,
    pub dataset_name: String,
    pub dataset_version: Option<String>,

    pub tracker_url: String,
    pub tracker_api_key: String,

    pub llm_api_url: String,
    pub llm_api_key: String,
    pub judge_model: String,
    pub agent_llm: String,

    pub poll_seconds: u64,
    pub turn_limit: usize,
    pub min_batch: usize,

    pub min_delta_primary: f64,
    pub min_delta_primary_train: f64,
    pub max_regression_secondary: f64,
    pub primary_metric: String,
    pub secondary_metric: String,

    pub update_live_prompt: bool,

    pub status_file: PathBuf,
    pub runs_dir: PathBuf,
    pub http_port: u16,

    pub eval_parallelism: usize,
    pub case_timeout_seconds: u64,
    pub llm_budget_per_tick: u32,
    /// Consecutive transient external failures tolerated before the process
    /// exits with code 3.
    pub max_consecutive_failures: u32,
    pub seed: u64,
}

fn var_required(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("{name} must be set"))
}

fn var_optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn var_parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var_optional(name) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{name} must be a valid value, got {raw:?}")),
        None => Ok(default),
    }
}

fn var_bool(name: &str, default: bool) -> bool {
    match var_optional(name) {
        Some(raw) => !(raw == "false" || raw == "0"),
        None => default,
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            project: var_required("AUTOTUNE_PROJECT")?,
            source_experiment: var_optional("AUTOTUNE_SOURCE_EXPERIMENT"),
            dataset_name: var_required("AUTOTUNE_DATASET_NAME")?,
            dataset_version: var_optional("AUTOTUNE_DATASET_VERSION"),

            tracker_url: var_required("AUTOTUNE_TRACKER_URL")?,
            tracker_api_key: var_required("AUTOTUNE_TRACKER_API_KEY")?,

            llm_api_url: var_required("AUTOTUNE_LLM_API_URL")?,
            llm_api_key: var_required("AUTOTUNE_LLM_API_KEY")?,
            judge_model: var_required("AUTOTUNE_JUDGE_MODEL")?,
            agent_llm: var_required("AUTOTUNE_AGENT_LLM")?,

            poll_seconds: var_parsed("AUTOTUNE_POLL_SECONDS", 15)?,
            turn_limit: var_parsed("AUTOTUNE_TURN_LIMIT", 20)?,
            min_batch: var_parsed("AUTOTUNE_MIN_BATCH", 5)?,

            min_delta_primary: var_parsed("AUTOTUNE_MIN_DELTA_PRIMARY", 0.10)?,
            min_delta_primary_train: var_parsed("AUTOTUNE_MIN_DELTA_PRIMARY_TRAIN", 0.05)?,
            max_regression_secondary: var_parsed("AUTOTUNE_MAX_REGRESSION_SECONDARY", 0.05)?,
            primary_metric: var_optional("AUTOTUNE_PRIMARY_METRIC")
                .unwrap_or_else(|| "judge_calmer_end_state".to_string()),
            secondary_metric: var_optional("AUTOTUNE_SECONDARY_METRIC")
                .unwrap_or_else(|| "judge_emergency_services_when_needed".to_string()),

            update_live_prompt: var_bool("AUTOTUNE_UPDATE_LIVE_PROMPT", false),

            status_file: PathBuf::from(
                var_optional("AUTOTUNE_STATUS_FILE")
                    .unwrap_or_else(|| "artifacts/autotune/status.json".to_string()),
            ),
            runs_dir: PathBuf::from(
                var_optional("AUTOTUNE_RUNS_DIR")
                    .unwrap_or_else(|| "artifacts/autotune/runs".to_string()),
            ),
            http_port: var_parsed("AUTOTUNE_HTTP_PORT", 3900)?,

            eval_parallelism: var_parsed("AUTOTUNE_EVAL_PARALLELISM", 8)?,
            case_timeout_seconds: var_parsed("AUTOTUNE_CASE_TIMEOUT_SECONDS", 120)?,
            llm_budget_per_tick: var_parsed("AUTOTUNE_LLM_BUDGET_PER_TICK", 400)?,
            max_consecutive_failures: var_parsed("AUTOTUNE_MAX_CONSECUTIVE_FAILURES", 20)?,
            seed: var_parsed("AUTOTUNE_SEED", 0)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Threshold sanity checks, separated out so they can be tested without
    /// touching the process environment.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.poll_seconds >= 1,
            "AUTOTUNE_POLL_SECONDS must be at least 1"
        );
        anyhow::ensure!(self.turn_limit >= 2, "AUTOTUNE_TURN_LIMIT must be at least 2");
        anyhow::ensure!(self.min_batch >= 1, "AUTOTUNE_MIN_BATCH must be at least 1");
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.min_delta_primary),
            "AUTOTUNE_MIN_DELTA_PRIMARY must be in [0, 1]"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.min_delta_primary_train),
            "AUTOTUNE_MIN_DELTA_PRIMARY_TRAIN must be in [0, 1]"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.max_regression_secondary),
            "AUTOTUNE_MAX_REGRESSION_SECONDARY must be in [0, 1]"
        );
        anyhow::ensure!(
            self.eval_parallelism >= 1,
            "AUTOTUNE_EVAL_PARALLELISM must be at least 1"
        );
        anyhow::ensure!(
            self.max_consecutive_failures >= 1,
            "AUTOTUNE_MAX_CONSECUTIVE_FAILURES must be at least 1"
        );
        anyhow::ensure!(
            self.primary_metric != self.secondary_metric,
            "primary and secondary metrics must differ"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            project: "floodline".to_string(),
            source_experiment: None,
            dataset_name: "crisis-calls".to_string(),
            dataset_version: None,
            tracker_url: "https://tracker.example.com".to_string(),
            tracker_api_key: "k".to_string(),
            llm_api_url: "https://llm.example.com/v1".to_string(),
            llm_api_key: "k".to_string(),
            judge_model: "judge-1".to_string(),
            agent_llm: "agent-1".to_string(),
            poll_seconds: 15,
            turn_limit: 20,
            min_batch: 5,
            min_delta_primary: 0.10,
            min_delta_primary_train: 0.05,
            max_regression_secondary: 0.05,
            primary_metric: "judge_calmer_end_state".to_string(),
            secondary_metric: "judge_emergency_services_when_needed".to_string(),
            update_live_prompt: false,
            status_file: PathBuf::from("status.json"),
            runs_dir: PathBuf::from("runs"),
            http_port: 3900,
            eval_parallelism: 8,
            case_timeout_seconds: 120,
            llm_budget_per_tick: 400,
            max_consecutive_failures: 20,
            seed: 0,
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_bad_threshold_rejected() {
        let mut config = base_config();
        config.min_delta_primary = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_metrics_must_differ() {
        let mut config = base_config();
        config.secondary_metric = config.primary_metric.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_failure_limit_rejected() {
        let mut config = base_config();
        config.max_consecutive_failures = 0;
        assert!(config.validate().is_err());
    }
}
