//! Simulated conversations between a candidate prompt and a scripted caller
//!
//! Two typed predictors drive the loop: the agent side runs the candidate
//! system prompt as its instruction, the caller side stays in character per
//! the dataset row's behavior profile. The loop ends when the caller reports
//! satisfaction, the agent hangs up, or the turn budget runs out.

use anyhow::{Context, Result};
use autotune_tracker::SimulatedUserProfile;
use dspy_rs::Predict;
use serde::{Deserialize, Serialize};

use crate::llm::LlmBudget;

/// One line of a simulated conversation. Role is "user" or "agent".
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TranscriptTurn {
    pub role: String,
    pub message: String,
}

impl TranscriptTurn {
    pub fn user(message: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            message: message.into(),
        }
    }

    pub fn agent(message: impl Into<String>) -> Self {
        Self {
            role: "agent".to_string(),
            message: message.into(),
        }
    }
}

/// Render turns the way they are fed back into the predictors.
pub fn render_transcript(turns: &[TranscriptTurn]) -> String {
    turns
        .iter()
        .map(|t| format!("[{}]: {}", t.role, t.message))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The agent's side of one exchange. The candidate system prompt is passed
/// as the predictor instruction, so this signature stays prompt-agnostic.
#[derive(dspy_rs::Signature, Clone, Debug)]
pub struct AgentTurn {
    #[input(desc = "Conversation so far, one [role]: message line per turn. Empty on the first turn.")]
    pub conversation: String,

    #[input(desc = "The caller's latest message")]
    pub caller_message: String,

    #[output(desc = "Your reasoning about the caller's state and what they need next")]
    pub reasoning: String,

    #[output(desc = "Your spoken reply to the caller")]
    pub message: String,

    #[output(desc = "\"yes\" to end the call after this reply, otherwise \"no\"")]
    pub end_call: String,
}

/// The caller's side of one exchange.
#[derive(dspy_rs::Signature, Clone, Debug)]
pub struct CallerTurn {
    #[input(desc = "Behavior profile you must stay in character for")]
    pub behavior_profile: String,

    #[input(desc = "Conversation so far, one [role]: message line per turn")]
    pub conversation: String,

    #[input(desc = "The agent's latest reply to you")]
    pub agent_message: String,

    #[output(desc = "Your reasoning, in character, about how you feel now")]
    pub reasoning: String,

    #[output(desc = "Your next message as the caller")]
    pub message: String,

    #[output(desc = "\"yes\" if your concern is fully addressed and you would hang up now, otherwise \"no\"")]
    pub satisfied: String,
}

/// Fixed instruction for the caller predictor. The behavior profile arrives
/// as an input field, so one instruction covers every row.
pub const CALLER_INSTRUCTION: &str = r#"You are role-playing a person calling a crisis-support line during a weather emergency.

Stay strictly in character per the behavior profile. React to what the agent
actually says: good guidance should gradually calm you, dismissive or vague
replies should not. Speak as the caller only, one message at a time, no stage
directions. Report satisfied="yes" only when your goal for the call is truly
met and you would hang up."#;

/// Why a simulated conversation ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    CallerSatisfied,
    AgentEnded,
    TurnLimit,
}

#[derive(Clone, Debug)]
pub struct SimulationOutcome {
    pub transcript: Vec<TranscriptTurn>,
    pub turn_count: usize,
    pub ended_by: EndReason,
}

/// Lenient yes/no flag parsing for predictor output fields.
pub fn flag_is_yes(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "yes" | "y" | "true" | "1"
    )
}

/// Run one case: alternate agent and caller turns under the candidate
/// prompt until satisfaction, hang-up, or the turn budget.
pub async fn simulate_case(
    prompt_text: &str,
    profile: &SimulatedUserProfile,
    turn_limit: usize,
    budget: &LlmBudget,
) -> Result<SimulationOutcome> {
    let agent_predictor = Predict::<AgentTurn>::builder()
        .instruction(prompt_text)
        .build();
    let caller_predictor = Predict::<CallerTurn>::builder()
        .instruction(CALLER_INSTRUCTION)
        .build();

    let behavior_profile = profile.behavior_instruction();
    let mut transcript: Vec<TranscriptTurn> = vec![TranscriptTurn::user(profile.text.clone())];
    let mut caller_message = profile.text.clone();
    let mut ended_by = EndReason::TurnLimit;

    while transcript.len() < turn_limit {
        budget.take()?;
        let agent_response = agent_predictor
            .call(AgentTurnInput {
                conversation: render_transcript(&transcript),
                caller_message: caller_message.clone(),
            })
            .await
            .context("agent turn failed")?;

        transcript.push(TranscriptTurn::agent(agent_response.message.clone()));
        if flag_is_yes(&agent_response.end_call) {
            ended_by = EndReason::AgentEnded;
            break;
        }
        if transcript.len() >= turn_limit {
            break;
        }

        budget.take()?;
        let caller_response = caller_predictor
            .call(CallerTurnInput {
                behavior_profile: behavior_profile.clone(),
                conversation: render_transcript(&transcript),
                agent_message: agent_response.message,
            })
            .await
            .context("caller turn failed")?;

        transcript.push(TranscriptTurn::user(caller_response.message.clone()));
        caller_message = caller_response.message;
        if flag_is_yes(&caller_response.satisfied) {
            ended_by = EndReason::CallerSatisfied;
            break;
        }
    }

    let turn_count = transcript.len();
    Ok(SimulationOutcome {
        transcript,
        turn_count,
        ended_by,
    })
}
