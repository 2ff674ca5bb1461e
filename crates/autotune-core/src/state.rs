//! Loop state and phase machine vocabulary
//!
//! The worker owns the single [`LoopState`] instance. Every transition is
//! persisted before the tick returns, so a crash between ticks resumes from
//! the last durable phase.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::artifacts;

/// Phase of the control loop's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Polling,
    Waiting,
    SnapshotBuilt,
    StrategiesGenerated,
    EvalTest,
    EvalTrain,
    Promoted,
    CycleComplete,
    Errored,
    Cancelled,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Polling => "polling",
            Phase::Waiting => "waiting",
            Phase::SnapshotBuilt => "snapshot_built",
            Phase::StrategiesGenerated => "strategies_generated",
            Phase::EvalTest => "eval_test",
            Phase::EvalTrain => "eval_train",
            Phase::Promoted => "promoted",
            Phase::CycleComplete => "cycle_complete",
            Phase::Errored => "errored",
            Phase::Cancelled => "cancelled",
        }
    }

    /// Phases from which the next tick starts a fresh poll.
    pub fn is_restartable(&self) -> bool {
        matches!(
            self,
            Phase::Idle | Phase::Waiting | Phase::CycleComplete | Phase::Errored | Phase::Cancelled
        )
    }

    /// Phases that sit in the middle of a run and must resume, not re-poll.
    pub fn is_mid_run(&self) -> bool {
        matches!(
            self,
            Phase::SnapshotBuilt
                | Phase::StrategiesGenerated
                | Phase::EvalTest
                | Phase::EvalTrain
                | Phase::Promoted
        )
    }
}

impl FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(Phase::Idle),
            "polling" => Ok(Phase::Polling),
            "waiting" => Ok(Phase::Waiting),
            "snapshot_built" => Ok(Phase::SnapshotBuilt),
            "strategies_generated" => Ok(Phase::StrategiesGenerated),
            "eval_test" => Ok(Phase::EvalTest),
            "eval_train" => Ok(Phase::EvalTrain),
            "promoted" => Ok(Phase::Promoted),
            "cycle_complete" => Ok(Phase::CycleComplete),
            "errored" => Ok(Phase::Errored),
            "cancelled" => Ok(Phase::Cancelled),
            _ => Err(anyhow::anyhow!("Invalid phase: {}", s)),
        }
    }
}

/// What a single tick did, instead of exceptions-as-control-flow.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// One durable phase transition happened.
    Progressed,
    /// Nothing to do (or told to back off); reason goes to the dashboard.
    Waited(String),
    /// Something went wrong; the kind decides the retry policy.
    Errored(ErrorKind),
}

/// Error classification from the policy table: transient errors leave state
/// untouched and retry next tick; fatal ones mark the run errored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransientExternal,
    RateLimited,
    ArtifactSchema,
    PublishFailed,
}

/// Process-wide mutable state, owned solely by the worker. Everything else
/// sees read-only snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopState {
    /// High-water mark: only traces strictly newer than this are counted.
    #[serde(default)]
    pub last_trace_cursor: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pending_trace_count: usize,
    pub current_phase: Phase,
    #[serde(default)]
    pub current_run_dir: Option<PathBuf>,
    #[serde(default)]
    pub promoted_prompt_hash: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl LoopState {
    pub fn new() -> Self {
        Self {
            last_trace_cursor: None,
            pending_trace_count: 0,
            current_phase: Phase::Idle,
            current_run_dir: None,
            promoted_prompt_hash: None,
            updated_at: Utc::now(),
        }
    }

    /// Load persisted state, or start fresh on first boot. A state file that
    /// no longer parses is quarantined rather than trusted.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::new();
        }
        match artifacts::read_json::<LoopState>(path) {
            Ok(state) => state,
            Err(err) => {
                tracing::error!(path = %path.display(), error = %err, "state file corrupt, quarantining");
                artifacts::quarantine(path);
                Self::new()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        artifacts::write_json_atomic(path, self)
    }
}

impl Default for LoopState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_round_trip() {
        for phase in [
            Phase::Idle,
            Phase::Waiting,
            Phase::SnapshotBuilt,
            Phase::StrategiesGenerated,
            Phase::EvalTest,
            Phase::EvalTrain,
            Phase::Promoted,
            Phase::CycleComplete,
            Phase::Errored,
            Phase::Cancelled,
        ] {
            assert_eq!(Phase::from_str(phase.as_str()).unwrap(), phase);
        }
        assert!(Phase::from_str("warming_up").is_err());
    }

    #[test]
    fn test_mid_run_phases_resume() {
        assert!(Phase::StrategiesGenerated.is_mid_run());
        assert!(Phase::EvalTest.is_mid_run());
        assert!(!Phase::Waiting.is_mid_run());
        assert!(Phase::Waiting.is_restartable());
        assert!(!Phase::EvalTrain.is_restartable());
    }

    #[test]
    fn test_state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut state = LoopState::new();
        state.current_phase = Phase::StrategiesGenerated;
        state.current_run_dir = Some(PathBuf::from("runs/20260801-120000"));
        state.pending_trace_count = 7;
        state.save(&path).unwrap();

        // Simulates the crash-recovery path: a restart sees the mid-run
        // phase and the run directory to resume from.
        let loaded = LoopState::load_or_default(&path);
        assert_eq!(loaded.current_phase, Phase::StrategiesGenerated);
        assert_eq!(
            loaded.current_run_dir,
            Some(PathBuf::from("runs/20260801-120000"))
        );
    }

    #[test]
    fn test_corrupt_state_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();

        let loaded = LoopState::load_or_default(&path);
        assert_eq!(loaded.current_phase, Phase::Idle);
        assert!(!path.exists());
    }
}
