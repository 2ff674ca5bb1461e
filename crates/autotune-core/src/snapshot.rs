//! Trace snapshot builder
//!
//! Freezes the exact set of traces a run will learn from: drops incomplete
//! records, dedupes by trace id, and joins each trace to its dataset row
//! where possible. Unjoined traces form the ad-hoc slice, which informs the
//! proposer but never feeds the promotion gate.

use autotune_tracker::{DatasetRow, Trace};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// The frozen input of one run; serialized verbatim as `source_traces.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TraceSnapshot {
    /// Cursor at tick start; every included trace is strictly newer.
    pub cursor_start: Option<DateTime<Utc>>,
    /// Newest `created_at` among included traces; becomes the next cursor.
    pub cursor_end: DateTime<Utc>,
    pub trace_count: usize,
    pub traces: Vec<Trace>,
    /// Case ids of traces joined to the train split.
    pub train_case_ids: Vec<String>,
    /// Case ids of traces joined to the test split.
    pub test_case_ids: Vec<String>,
    /// Trace ids with no dataset row behind them.
    pub ad_hoc_trace_ids: Vec<String>,
}

/// Build a snapshot from freshly fetched traces and the current dataset
/// binding. Returns `None` when nothing usable arrived.
pub fn build_snapshot(
    cursor_start: Option<DateTime<Utc>>,
    fetched: Vec<Trace>,
    train_rows: &[DatasetRow],
    test_rows: &[DatasetRow],
) -> Option<TraceSnapshot> {
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut traces: Vec<Trace> = Vec::new();

    for trace in fetched {
        if !trace.is_complete() {
            debug!(trace_id = %trace.trace_id, "dropping incomplete trace");
            continue;
        }
        if let Some(start) = cursor_start {
            if trace.created_at <= start {
                continue;
            }
        }
        if !seen.insert(trace.trace_id.clone()) {
            continue;
        }
        traces.push(trace);
    }

    let cursor_end = traces.iter().map(|t| t.created_at).max()?;

    let train_ids: BTreeSet<&str> = train_rows.iter().map(|r| r.case_id.as_str()).collect();
    let test_ids: BTreeSet<&str> = test_rows.iter().map(|r| r.case_id.as_str()).collect();

    let mut train_case_ids = Vec::new();
    let mut test_case_ids = Vec::new();
    let mut ad_hoc_trace_ids = Vec::new();
    for trace in &traces {
        match trace.input_case_id.as_deref() {
            Some(case_id) if train_ids.contains(case_id) => {
                train_case_ids.push(case_id.to_string())
            }
            Some(case_id) if test_ids.contains(case_id) => test_case_ids.push(case_id.to_string()),
            _ => ad_hoc_trace_ids.push(trace.trace_id.clone()),
        }
    }
    train_case_ids.sort();
    train_case_ids.dedup();
    test_case_ids.sort();
    test_case_ids.dedup();

    Some(TraceSnapshot {
        cursor_start,
        cursor_end,
        trace_count: traces.len(),
        traces,
        train_case_ids,
        test_case_ids,
        ad_hoc_trace_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use autotune_tracker::TraceTurn;
    use chrono::TimeZone;

    fn trace(id: &str, minute: u32, case_id: Option<&str>) -> Trace {
        Trace {
            trace_id: id.to_string(),
            experiment_id: "live".to_string(),
            created_at: Utc.with_ymd_and_hms(2026, 7, 1, 12, minute, 0).unwrap(),
            input_case_id: case_id.map(String::from),
            turns: vec![TraceTurn {
                role: "user".to_string(),
                message: "help".to_string(),
            }],
            tool_calls: vec![],
            metrics: Default::default(),
            prompt_hash: "hash".to_string(),
            needs_emergency: None,
        }
    }

    fn row(case_id: &str, split: &str) -> DatasetRow {
        serde_json::from_str(&format!(
            r#"{{
                "case_id": "{case_id}",
                "input": {{"simulated_user": {{"text": "hi"}}}},
                "metadata": {{"split": "{split}"}}
            }}"#
        ))
        .unwrap()
    }

    #[test]
    fn test_dedupe_and_join() {
        let train = vec![row("c1", "train")];
        let test = vec![row("c2", "test")];
        let fetched = vec![
            trace("t1", 1, Some("c1")),
            trace("t1", 1, Some("c1")), // duplicate id
            trace("t2", 2, Some("c2")),
            trace("t3", 3, None), // organic call
            trace("t4", 4, Some("c-unknown")),
        ];

        let snapshot = build_snapshot(None, fetched, &train, &test).unwrap();
        assert_eq!(snapshot.trace_count, 4);
        assert_eq!(snapshot.train_case_ids, vec!["c1"]);
        assert_eq!(snapshot.test_case_ids, vec!["c2"]);
        assert_eq!(snapshot.ad_hoc_trace_ids, vec!["t3", "t4"]);
    }

    #[test]
    fn test_cursor_window() {
        let start = Utc.with_ymd_and_hms(2026, 7, 1, 12, 2, 0).unwrap();
        let fetched = vec![trace("t1", 1, None), trace("t2", 2, None), trace("t3", 3, None)];
        let snapshot = build_snapshot(Some(start), fetched, &[], &[]).unwrap();

        // Only t3 is strictly newer than the cursor.
        assert_eq!(snapshot.trace_count, 1);
        assert_eq!(snapshot.cursor_start, Some(start));
        assert_eq!(
            snapshot.cursor_end,
            Utc.with_ymd_and_hms(2026, 7, 1, 12, 3, 0).unwrap()
        );
    }

    #[test]
    fn test_incomplete_traces_dropped() {
        let mut bad = trace("t1", 1, None);
        bad.turns.clear();
        assert!(build_snapshot(None, vec![bad], &[], &[]).is_none());
    }

    #[test]
    fn test_empty_fetch_yields_none() {
        assert!(build_snapshot(None, vec![], &[], &[]).is_none());
    }
}
