//! Trace wire types
//!
//! A trace is one completed multi-turn conversation recorded by the live
//! voice agent. Traces are immutable once written; identity is `trace_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One user/agent exchange inside a trace.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TraceTurn {
    /// "user" or "agent"
    pub role: String,
    pub message: String,
}

/// A tool invocation the agent made during the conversation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    #[serde(default)]
    pub args: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub result: Option<String>,
}

/// One completed conversation as stored by the tracker.
///
/// Unknown fields from the service are ignored on read; we never write
/// fields that are not listed here.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: String,
    pub experiment_id: String,
    pub created_at: DateTime<Utc>,
    /// Links the trace back to a dataset row, when the conversation was
    /// driven by a known case. Organic calls have no case id.
    #[serde(default)]
    pub input_case_id: Option<String>,
    #[serde(default)]
    pub turns: Vec<TraceTurn>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
    /// Scorer name -> value, as recorded at trace time.
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    /// Hash of the system prompt that produced this conversation.
    pub prompt_hash: String,
    /// Ground-truth hint: did this caller actually need emergency services?
    #[serde(default)]
    pub needs_emergency: Option<bool>,
}

impl Trace {
    /// A trace is usable only when the identifying fields are present.
    pub fn is_complete(&self) -> bool {
        !self.trace_id.is_empty() && !self.prompt_hash.is_empty() && !self.turns.is_empty()
    }

    /// Concatenated agent-side text, used by scorers and the proposer.
    pub fn agent_text(&self) -> String {
        self.turns
            .iter()
            .filter(|t| t.role == "agent")
            .map(|t| t.message.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Full transcript rendered one turn per line.
    pub fn render_transcript(&self) -> String {
        self.turns
            .iter()
            .map(|t| format!("[{}]: {}", t.role, t.message))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_trace(id: &str) -> Trace {
        Trace {
            trace_id: id.to_string(),
            experiment_id: "exp".to_string(),
            created_at: Utc::now(),
            input_case_id: None,
            turns: vec![
                TraceTurn {
                    role: "user".to_string(),
                    message: "help, water is rising".to_string(),
                },
                TraceTurn {
                    role: "agent".to_string(),
                    message: "Move to higher ground now.".to_string(),
                },
            ],
            tool_calls: vec![],
            metrics: BTreeMap::new(),
            prompt_hash: "abc".to_string(),
            needs_emergency: Some(true),
        }
    }

    #[test]
    fn test_complete_trace() {
        assert!(make_trace("t1").is_complete());

        let mut missing = make_trace("t2");
        missing.turns.clear();
        assert!(!missing.is_complete());
    }

    #[test]
    fn test_agent_text_filters_user_turns() {
        let trace = make_trace("t1");
        let text = trace.agent_text();
        assert!(text.contains("higher ground"));
        assert!(!text.contains("water is rising"));
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let raw = r#"{
            "trace_id": "t9",
            "experiment_id": "e1",
            "created_at": "2026-07-01T12:00:00Z",
            "prompt_hash": "h",
            "turns": [{"role": "user", "message": "hi", "latency_ms": 120}],
            "some_future_field": {"nested": true}
        }"#;
        let trace: Trace = serde_json::from_str(raw).unwrap();
        assert_eq!(trace.trace_id, "t9");
        assert_eq!(trace.turns.len(), 1);
    }
}
