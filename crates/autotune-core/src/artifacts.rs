//! Run directories and artifact persistence
//!
//! Every artifact is JSON, written temp-then-rename so the status API never
//! sees a torn file. Run directories are named with a sortable UTC stamp, so
//! lexicographic order is chronological order.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::state::Phase;

pub const SOURCE_TRACES_FILE: &str = "source_traces.json";
pub const FINDINGS_FILE: &str = "findings_and_variants.json";
pub const VARIANT_RUNS_FILE: &str = "variant_runs.json";
pub const DECISION_FILE: &str = "promotion_decision.json";

/// Serialize `value` to `path` atomically. The temp name carries a uuid so
/// two writers racing on the same file (worker transition vs. the status
/// recovery path) cannot clobber each other's half-written temp.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));
    std::fs::write(&tmp, content).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("decoding {}", path.display()))
}

/// Move a corrupt file or run directory aside so the loop can continue with
/// a clean slate. Best-effort: failure to quarantine is logged, not fatal.
pub fn quarantine(path: &Path) {
    let mut target = path.as_os_str().to_owned();
    target.push(".quarantined");
    if let Err(err) = std::fs::rename(path, PathBuf::from(&target)) {
        tracing::error!(path = %path.display(), error = %err, "failed to quarantine");
    } else {
        tracing::warn!(path = %path.display(), "quarantined corrupt artifact");
    }
}

/// Compact view of the latest run for the dashboard. Written after every
/// phase transition, next to (not inside) the run directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub phase: Phase,
    #[serde(default)]
    pub reason: Option<String>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub new_trace_count: usize,
    #[serde(default)]
    pub current_run: Option<String>,
    #[serde(default)]
    pub promoted_prompt_hash: Option<String>,
}

/// Owns the runs directory and the status file location.
#[derive(Clone)]
pub struct RunStore {
    runs_dir: PathBuf,
    status_file: PathBuf,
}

impl RunStore {
    pub fn new(runs_dir: PathBuf, status_file: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&runs_dir)
            .with_context(|| format!("creating {}", runs_dir.display()))?;
        Ok(Self {
            runs_dir,
            status_file,
        })
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    pub fn status_file(&self) -> &Path {
        &self.status_file
    }

    /// Where the loop state itself is persisted.
    pub fn state_file(&self) -> PathBuf {
        self.runs_dir.join("state.json")
    }

    /// Create the next run directory. Stamps are second-resolution; a
    /// collision within the same second gets a disambiguating suffix.
    pub fn create_run_dir(&self, now: DateTime<Utc>) -> Result<PathBuf> {
        let stamp = now.format("%Y%m%d-%H%M%S").to_string();
        let mut dir = self.runs_dir.join(&stamp);
        let mut attempt = 1;
        while dir.exists() {
            dir = self.runs_dir.join(format!("{stamp}-{attempt}"));
            attempt += 1;
        }
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        Ok(dir)
    }

    /// Most recent run directory, by name. Quarantined dirs are skipped.
    pub fn latest_run_dir(&self) -> Option<PathBuf> {
        let entries = std::fs::read_dir(&self.runs_dir).ok()?;
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.is_dir()
                    && !p
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.ends_with(".quarantined"))
            })
            .collect();
        dirs.sort();
        dirs.pop()
    }

    pub fn write_status(&self, status: &StatusSnapshot) -> Result<()> {
        write_json_atomic(&self.status_file, status)
    }

    /// Read the dashboard snapshot. A corrupt file is quarantined and
    /// replaced with a fresh idle snapshot so readers always get valid JSON.
    pub fn read_status(&self) -> StatusSnapshot {
        if self.status_file.exists() {
            match read_json::<StatusSnapshot>(&self.status_file) {
                Ok(status) => return status,
                Err(err) => {
                    tracing::error!(error = %err, "status file corrupt");
                    quarantine(&self.status_file);
                }
            }
        }
        let fresh = StatusSnapshot {
            phase: Phase::Idle,
            reason: None,
            updated_at: Utc::now(),
            new_trace_count: 0,
            current_run: None,
            promoted_prompt_hash: None,
        };
        if let Err(err) = self.write_status(&fresh) {
            tracing::error!(error = %err, "failed to write fresh status");
        }
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn store() -> (tempfile::TempDir, RunStore) {
        let dir = tempfile::tempdir().unwrap();
        let runs = dir.path().join("runs");
        let status = dir.path().join("status.json");
        let store = RunStore::new(runs, status).unwrap();
        (dir, store)
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_file() {
        let (_guard, store) = store();
        let path = store.runs_dir().join("value.json");
        write_json_atomic(&path, &serde_json::json!({"a": 1})).unwrap();
        assert!(path.exists());
        let leftovers = std::fs::read_dir(store.runs_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .count();
        assert_eq!(leftovers, 0);
        let back: serde_json::Value = read_json(&path).unwrap();
        assert_eq!(back["a"], 1);
    }

    #[test]
    fn test_run_dirs_sort_chronologically() {
        let (_guard, store) = store();
        let earlier = Utc.with_ymd_and_hms(2026, 7, 1, 10, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2026, 7, 1, 11, 30, 0).unwrap();
        store.create_run_dir(earlier).unwrap();
        let newest = store.create_run_dir(later).unwrap();
        assert_eq!(store.latest_run_dir().unwrap(), newest);
    }

    #[test]
    fn test_same_second_runs_get_distinct_dirs() {
        let (_guard, store) = store();
        let now = Utc.with_ymd_and_hms(2026, 7, 1, 10, 0, 0).unwrap();
        let first = store.create_run_dir(now).unwrap();
        let second = store.create_run_dir(now).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_corrupt_status_replaced_with_fresh() {
        let (_guard, store) = store();
        std::fs::write(store.status_file(), "{{torn").unwrap();
        let status = store.read_status();
        assert_eq!(status.phase, Phase::Idle);
        // The replacement must itself be readable.
        let reread: StatusSnapshot = read_json(store.status_file()).unwrap();
        assert_eq!(reread.phase, Phase::Idle);
    }

    #[test]
    fn test_latest_skips_quarantined_dirs() {
        let (_guard, store) = store();
        let now = Utc.with_ymd_and_hms(2026, 7, 1, 10, 0, 0).unwrap();
        let bad = store.create_run_dir(now).unwrap();
        quarantine(&bad);
        assert!(store.latest_run_dir().is_none());
    }
}
