//! Read-only status API for the dashboard
//!
//! One merged JSON blob: the durable status snapshot plus whatever artifacts
//! the latest run has written so far. Readers may observe any prefix of the
//! run's artifact sequence, but never a torn file, because every artifact is
//! written atomically.

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::artifacts::{
    RunStore, DECISION_FILE, FINDINGS_FILE, SOURCE_TRACES_FILE, VARIANT_RUNS_FILE,
};
use crate::evaluator::VariantRun;
use crate::promotion::PromotionDecision;
use crate::proposer::FindingsAndVariants;
use crate::snapshot::TraceSnapshot;

#[derive(Clone)]
struct ApiState {
    store: RunStore,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Health check endpoint - returns 200 OK when the service is running.
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn status(State(state): State<ApiState>) -> Json<Value> {
    Json(merge_status(&state.store))
}

/// Build the dashboard blob. Artifacts that do not exist yet are simply
/// absent from the result; nothing here writes except the corrupt-status
/// recovery inside `read_status`.
pub fn merge_status(store: &RunStore) -> Value {
    let snapshot = store.read_status();
    let mut blob = serde_json::to_value(&snapshot).unwrap_or_else(|_| Value::Object(Default::default()));
    let Value::Object(ref mut fields) = blob else {
        return blob;
    };

    if let Some(run_dir) = store.latest_run_dir() {
        if let Some(name) = run_dir.file_name().and_then(|n| n.to_str()) {
            fields.insert("latest_run".to_string(), Value::String(name.to_string()));
        }

        if let Ok(traces) =
            crate::artifacts::read_json::<TraceSnapshot>(&run_dir.join(SOURCE_TRACES_FILE))
        {
            fields.insert("source_trace_count".to_string(), traces.trace_count.into());
        }

        if let Ok(findings) =
            crate::artifacts::read_json::<FindingsAndVariants>(&run_dir.join(FINDINGS_FILE))
        {
            if let Ok(value) = serde_json::to_value(&findings.findings) {
                fields.insert("findings".to_string(), value);
            }
            let variants: Vec<Value> = findings
                .variants
                .iter()
                .map(|v| {
                    serde_json::json!({
                        "name": v.name,
                        "rationale": v.rationale,
                        "hash": v.hash,
                        "parent_hash": v.parent_hash,
                    })
                })
                .collect();
            fields.insert("variants".to_string(), Value::Array(variants));
        }

        if let Ok(runs) =
            crate::artifacts::read_json::<Vec<VariantRun>>(&run_dir.join(VARIANT_RUNS_FILE))
        {
            let summaries: Vec<Value> = runs
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "variant_name": r.variant_name,
                        "split": r.split,
                        "metrics": r.metrics,
                        "avg_turn_count": r.avg_turn_count,
                        "malformed_judge_count": r.malformed_judge_count,
                        "phase": r.phase,
                    })
                })
                .collect();
            fields.insert("variant_runs".to_string(), Value::Array(summaries));
        }

        if let Ok(decision) =
            crate::artifacts::read_json::<PromotionDecision>(&run_dir.join(DECISION_FILE))
        {
            fields.insert("winner".to_string(), serde_json::to_value(&decision.winner).unwrap_or(Value::Null));
            fields.insert("promoted".to_string(), Value::Bool(decision.promoted));
            fields.insert("decision_reason".to_string(), Value::String(decision.reason));
        }
    }

    fields.insert(
        "server_time".to_string(),
        Value::String(Utc::now().to_rfc3339()),
    );
    blob
}

pub fn router(store: RunStore) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/healthz", get(health_check))
        .with_state(ApiState { store })
}

/// Serve the API until the process exits.
pub async fn serve(store: RunStore, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "status API listening");
    axum::serve(listener, router(store)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{write_json_atomic, StatusSnapshot};
    use crate::state::Phase;
    use chrono::TimeZone;

    fn store() -> (tempfile::TempDir, RunStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path().join("runs"), dir.path().join("status.json")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_merge_with_no_runs_yet() {
        let (_guard, store) = store();
        store
            .write_status(&StatusSnapshot {
                phase: Phase::Waiting,
                reason: Some("insufficient new traces: 3 < 5".to_string()),
                updated_at: Utc::now(),
                new_trace_count: 3,
                current_run: None,
                promoted_prompt_hash: None,
            })
            .unwrap();

        let blob = merge_status(&store);
        assert_eq!(blob["phase"], "waiting");
        assert_eq!(blob["new_trace_count"], 3);
        assert!(blob.get("latest_run").is_none());
        // server_time is always present and fresh enough to parse.
        assert!(chrono::DateTime::parse_from_rfc3339(blob["server_time"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn test_merge_includes_partial_artifact_prefix() {
        let (_guard, store) = store();
        store.read_status();
        let now = Utc.with_ymd_and_hms(2026, 7, 1, 9, 0, 0).unwrap();
        let run_dir = store.create_run_dir(now).unwrap();

        // Only source_traces has been written so far; the merge must expose
        // the prefix without erroring on the missing files.
        let snapshot = crate::snapshot::TraceSnapshot {
            cursor_start: None,
            cursor_end: now,
            trace_count: 12,
            traces: vec![],
            train_case_ids: vec![],
            test_case_ids: vec![],
            ad_hoc_trace_ids: vec![],
        };
        write_json_atomic(&run_dir.join(SOURCE_TRACES_FILE), &snapshot).unwrap();

        let blob = merge_status(&store);
        assert_eq!(blob["source_trace_count"], 12);
        assert!(blob.get("findings").is_none());
        assert!(blob.get("promoted").is_none());
    }
}
