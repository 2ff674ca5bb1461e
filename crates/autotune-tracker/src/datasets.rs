//! Dataset wire types
//!
//! Frozen evaluation rows. A `(name, version)` pair is immutable on the
//! tracker side, so rows can be cached per run without invalidation logic.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Caller attitude at the start of the scenario.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attitude {
    Calm,
    Anxious,
    Panicked,
    Angry,
    Skeptical,
}

/// Vocal tone the simulated caller should project.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Flat,
    Frightened,
    Urgent,
    Hostile,
    Hopeful,
}

/// Three-step scale shared by cooperativeness and patience.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Low,
    Medium,
    High,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    Terse,
    Moderate,
    Rambling,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Level::Low => "low",
            Level::Medium => "medium",
            Level::High => "high",
        };
        write!(f, "{s}")
    }
}

/// Behavior profile that drives the simulated caller for one case.
///
/// The option set is closed on purpose: rows carrying keys outside this
/// struct are rejected at decode time rather than silently shaping the
/// simulation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulatedUserProfile {
    /// Opening message of the call.
    pub text: String,
    #[serde(default)]
    pub attitude: Option<Attitude>,
    #[serde(default)]
    pub tone: Option<Tone>,
    #[serde(default)]
    pub cooperativeness: Option<Level>,
    #[serde(default)]
    pub verbosity: Option<Verbosity>,
    #[serde(default)]
    pub patience: Option<Level>,
    /// What the caller is actually trying to get out of the call.
    #[serde(default)]
    pub goal: Option<String>,
    /// Ground truth: this scenario requires emergency-services escalation.
    #[serde(default)]
    pub needs_emergency: Option<bool>,
}

impl SimulatedUserProfile {
    /// Render the profile as an in-character instruction for the caller
    /// predictor. Only set fields appear.
    pub fn behavior_instruction(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(a) = self.attitude {
            parts.push(format!("attitude={a:?}").to_lowercase());
        }
        if let Some(t) = self.tone {
            parts.push(format!("tone={t:?}").to_lowercase());
        }
        if let Some(c) = self.cooperativeness {
            parts.push(format!("cooperativeness={c}"));
        }
        if let Some(v) = self.verbosity {
            parts.push(format!("verbosity={v:?}").to_lowercase());
        }
        if let Some(p) = self.patience {
            parts.push(format!("patience={p}"));
        }
        if let Some(goal) = &self.goal {
            parts.push(format!("goal={goal}"));
        }
        if parts.is_empty() {
            return "Stay in character as the caller for the whole conversation.".to_string();
        }
        format!(
            "Simulated caller behavior profile. Stay in character for the conversation. {}.",
            parts.join("; ")
        )
    }
}

/// Structured input for one evaluation case.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaseInput {
    pub simulated_user: SimulatedUserProfile,
}

/// One frozen dataset row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatasetRow {
    pub case_id: String,
    pub input: CaseInput,
    /// Optional reference answer or label.
    #[serde(default)]
    pub expected: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl DatasetRow {
    /// Which split this row belongs to ("train" unless tagged otherwise).
    pub fn split(&self) -> &str {
        self.metadata
            .get("split")
            .and_then(|v| v.as_str())
            .unwrap_or("train")
    }

    /// Ground-truth emergency need for this case, falling back to a scan of
    /// the opening text for danger terms when the row does not say.
    pub fn needs_emergency(&self) -> bool {
        if let Some(flag) = self.input.simulated_user.needs_emergency {
            return flag;
        }
        let text = self.input.simulated_user.text.to_lowercase();
        const RISK_TERMS: [&str; 8] = [
            "flood",
            "stranded",
            "danger",
            "life-threatening",
            "emergency",
            "help",
            "trapped",
            "evacuate",
        ];
        RISK_TERMS.iter().any(|t| text.contains(t))
    }
}

/// Partition rows into (train, test) by their split tag. Rows tagged with
/// anything other than "train"/"test" are dropped with a warning.
pub fn split_rows(rows: Vec<DatasetRow>) -> (Vec<DatasetRow>, Vec<DatasetRow>) {
    let mut train = Vec::new();
    let mut test = Vec::new();
    for row in rows {
        match row.split() {
            "train" => train.push(row),
            "test" => test.push(row),
            other => {
                tracing::warn!(case_id = %row.case_id, split = %other, "unknown split tag, dropping row");
            }
        }
    }
    (train, test)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row_json(case_id: &str, split: &str) -> String {
        format!(
            r#"{{
                "case_id": "{case_id}",
                "input": {{"simulated_user": {{"text": "the water is rising", "attitude": "panicked", "patience": "low"}}}},
                "metadata": {{"split": "{split}"}}
            }}"#
        )
    }

    #[test]
    fn test_profile_rejects_unknown_keys() {
        let raw = r#"{"text": "hi", "attitude": "calm", "mood": "sneaky"}"#;
        let parsed: Result<SimulatedUserProfile, _> = serde_json::from_str(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_profile_rejects_unknown_enum_value() {
        let raw = r#"{"text": "hi", "attitude": "devious"}"#;
        let parsed: Result<SimulatedUserProfile, _> = serde_json::from_str(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_behavior_instruction_lists_set_fields() {
        let row: DatasetRow = serde_json::from_str(&row_json("c1", "train")).unwrap();
        let instruction = row.input.simulated_user.behavior_instruction();
        assert!(instruction.contains("attitude=panicked"));
        assert!(instruction.contains("patience=low"));
        assert!(!instruction.contains("verbosity"));
    }

    #[test]
    fn test_split_rows() {
        let rows: Vec<DatasetRow> = vec![
            serde_json::from_str(&row_json("c1", "train")).unwrap(),
            serde_json::from_str(&row_json("c2", "test")).unwrap(),
            serde_json::from_str(&row_json("c3", "holdout")).unwrap(),
        ];
        let (train, test) = split_rows(rows);
        assert_eq!(train.len(), 1);
        assert_eq!(test.len(), 1);
        assert_eq!(test[0].case_id, "c2");
    }

    #[test]
    fn test_needs_emergency_falls_back_to_danger_terms() {
        let row: DatasetRow = serde_json::from_str(&row_json("c1", "train")).unwrap();
        // No explicit flag, but the opening text mentions rising water only --
        // none of the risk terms match, so this is a non-emergency case.
        assert!(!row.needs_emergency());

        let raw = r#"{
            "case_id": "c2",
            "input": {"simulated_user": {"text": "I am trapped on the roof"}}
        }"#;
        let trapped: DatasetRow = serde_json::from_str(raw).unwrap();
        assert!(trapped.needs_emergency());
    }
}
