//! Strategy proposer
//!
//! Turns a trace snapshot into findings plus a small set of candidate prompt
//! variants. Per-trace reviews come from the judge model; variant texts come
//! from the generator model, one named lever at a time, with hash-equality
//! dedup against the current prompt and each other.

use anyhow::Result;
use autotune_tracker::Trace;
use dspy_rs::Predict;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::llm::LlmBudget;

/// Lowercase hex SHA-256; prompt identity everywhere in the loop.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Seed system prompt used until a first promotion lands in the registry.
pub const SEED_PROMPT: &str = r#"You are a calm, steady voice agent for a weather-crisis support line.

Callers may be frightened, in danger, or just looking for information. Listen
first, validate what the caller is feeling, and keep replies short enough to
be spoken aloud. If the caller describes immediate physical danger, tell them
to contact emergency services before anything else, then give concrete safety
steps one at a time. End the call once the caller is safe and has what they
need."#;

/// Retries for the whole variant-generation pass before falling back.
const MAX_GENERATION_RETRIES: usize = 3;
/// Only the most recent traces feed the review pass; older ones add cost
/// without adding signal.
const MAX_REVIEWED_TRACES: usize = 30;

/// The levers a variant must move. Each generated variant is pinned to one
/// so the pair explores different directions instead of rewording each other.
pub const VARIANT_LEVERS: [&str; 4] = [
    "escalation ordering: when emergency-services routing happens relative to everything else",
    "de-escalation cadence: how early and how often calming language appears",
    "turn budget: how quickly the call converges to resolution",
    "action specificity: how concrete the safety instructions are",
];

/// Safe fallbacks so a cycle always has something to evaluate even when the
/// generator produces nothing usable.
const FALLBACK_VARIANTS: [(&str, &str); 2] = [
    (
        "You are a calm emergency responder. In immediate danger cases, first validate emotions, \
         then instruct contacting emergency services, then provide exactly three concrete safety steps.",
        "fallback: validation-first escalation template",
    ),
    (
        "You are a high-urgency crisis assistant. If flood/fire/trapped risk appears, immediately \
         escalate to emergency services and provide concise step-by-step evacuation/safety actions \
         before follow-up questions.",
        "fallback: escalation-first urgency template",
    ),
];

/// A candidate system prompt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PromptVariant {
    pub name: String,
    pub text: String,
    pub rationale: String,
    /// Hash of the prompt this variant mutates.
    pub parent_hash: String,
    pub hash: String,
}

/// The run's `findings_and_variants.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindingsAndVariants {
    pub findings: Vec<String>,
    pub why_it_failed: Vec<String>,
    pub variants: Vec<PromptVariant>,
    /// Sampling temperature that was actually in effect for generation. The
    /// gateway may ignore seeds, so this is recorded rather than assumed.
    pub effective_temperature: f32,
    pub seed: u64,
    pub generator_model: String,
}

/// Per-trace review from the judge model.
#[derive(dspy_rs::Signature, Clone, Debug)]
struct TraceReview {
    #[input(desc = "The caller's opening message / scenario")]
    scenario: String,

    #[input(desc = "Full conversation transcript")]
    transcript: String,

    #[input(desc = "Recorded scorer values for this conversation, name=value per line")]
    scorer_summary: String,

    #[output(desc = "Short statements of what the agent did well")]
    worked: Vec<String>,

    #[output(desc = "Short statements of what the agent got wrong or missed")]
    failed: Vec<String>,

    #[output(desc = "One concrete prompt edit that would fix the biggest failure")]
    fix_snippet: String,
}

const REVIEW_INSTRUCTION: &str = "You review crisis-line conversations. Be specific and terse: \
     each worked/failed entry is one observable behavior, not a vibe. The fix \
     snippet must be wording that could be pasted into a system prompt.";

/// One variant proposal from the generator model.
#[derive(dspy_rs::Signature, Clone, Debug)]
struct VariantProposal {
    #[input(desc = "The system prompt currently in production")]
    current_prompt: String,

    #[input(desc = "Aggregated findings from recent conversations, one per line")]
    findings: String,

    #[input(desc = "The single lever this variant must change")]
    lever: String,

    #[output(desc = "Why this revision should score better on the findings")]
    rationale: String,

    #[output(desc = "The complete revised system prompt, directly usable as-is")]
    prompt_text: String,
}

const PROPOSAL_INSTRUCTION: &str = "You are an expert prompt engineer for a crisis-response voice \
     agent. Produce a complete revised system prompt that addresses the \
     findings by moving the named lever. Keep everything that already works; \
     change what the lever names. Output the full prompt, not a diff.";

/// Seeded xorshift64; deterministic lever selection without a rand
/// dependency.
struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    fn new(seed: u64) -> Self {
        // xorshift has a zero fixed point.
        Self {
            state: seed.max(1),
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    fn next_usize(&mut self) -> usize {
        self.next_u64() as usize
    }
}

/// Order the levers for this run: seeded shuffle, so retries walk the
/// remaining levers deterministically.
fn lever_order(seed: u64) -> Vec<&'static str> {
    let mut rng = SimpleRng::new(seed);
    let mut levers: Vec<&'static str> = VARIANT_LEVERS.to_vec();
    for i in (1..levers.len()).rev() {
        let j = rng.next_usize() % (i + 1);
        levers.swap(i, j);
    }
    levers
}

/// Fold per-trace reviews into 3-6 findings (most common failures first)
/// and the distinct fix snippets behind them.
fn aggregate_findings(
    failures: &[Vec<String>],
    fix_snippets: &[String],
) -> (Vec<String>, Vec<String>) {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for failed in failures {
        for item in failed {
            let normalized = item.trim().to_lowercase();
            if normalized.is_empty() {
                continue;
            }
            *counts.entry(normalized).or_insert(0) += 1;
        }
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    // Count descending, then alphabetical so equal counts order stably.
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let findings: Vec<String> = ranked
        .into_iter()
        .take(6)
        .map(|(finding, count)| {
            if count > 1 {
                format!("{finding} ({count} conversations)")
            } else {
                finding
            }
        })
        .collect();

    let mut why_it_failed: Vec<String> = Vec::new();
    for snippet in fix_snippets {
        let trimmed = snippet.trim();
        if trimmed.is_empty() || why_it_failed.iter().any(|s| s == trimmed) {
            continue;
        }
        why_it_failed.push(trimmed.to_string());
        if why_it_failed.len() >= 6 {
            break;
        }
    }

    (findings, why_it_failed)
}

fn scorer_summary(trace: &Trace) -> String {
    if trace.metrics.is_empty() {
        return "no recorded scores".to_string();
    }
    trace
        .metrics
        .iter()
        .map(|(name, value)| format!("{name}={value:.3}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct Proposer {
    pub variant_count: usize,
    pub effective_temperature: f32,
    pub seed: u64,
    pub generator_model: String,
}

impl Proposer {
    /// Run the full propose pass: per-trace reviews, findings aggregation,
    /// then variant generation. The judge LM must be the active model; it
    /// handles both the reviewing and the proposing.
    pub async fn propose(
        &self,
        traces: &[Trace],
        current_prompt: &str,
        budget: &LlmBudget,
    ) -> Result<FindingsAndVariants> {
        let review_predictor = Predict::<TraceReview>::builder()
            .instruction(REVIEW_INSTRUCTION)
            .build();

        let recent: &[Trace] = if traces.len() > MAX_REVIEWED_TRACES {
            &traces[traces.len() - MAX_REVIEWED_TRACES..]
        } else {
            traces
        };

        let mut failures: Vec<Vec<String>> = Vec::new();
        let mut fix_snippets: Vec<String> = Vec::new();
        for trace in recent {
            budget.take()?;
            let scenario = trace
                .turns
                .iter()
                .find(|t| t.role == "user")
                .map(|t| t.message.clone())
                .unwrap_or_default();
            let review = review_predictor
                .call(TraceReviewInput {
                    scenario,
                    transcript: trace.render_transcript(),
                    scorer_summary: scorer_summary(trace),
                })
                .await;
            match review {
                Ok(out) => {
                    failures.push(out.failed);
                    fix_snippets.push(out.fix_snippet);
                }
                Err(err) => {
                    warn!(trace_id = %trace.trace_id, error = %err, "trace review failed, skipping");
                }
            }
        }

        let (mut findings, why_it_failed) = aggregate_findings(&failures, &fix_snippets);
        info!(findings = findings.len(), reviewed = recent.len(), "aggregated findings");

        let (variants, shortfall) = self
            .generate_variants(current_prompt, &findings, budget)
            .await?;
        if let Some(note) = shortfall {
            findings.push(note);
        }

        Ok(FindingsAndVariants {
            findings,
            why_it_failed,
            variants,
            effective_temperature: self.effective_temperature,
            seed: self.seed,
            generator_model: self.generator_model.clone(),
        })
    }

    async fn generate_variants(
        &self,
        current_prompt: &str,
        findings: &[String],
        budget: &LlmBudget,
    ) -> Result<(Vec<PromptVariant>, Option<String>)> {
        let proposal_predictor = Predict::<VariantProposal>::builder()
            .instruction(PROPOSAL_INSTRUCTION)
            .build();

        let parent_hash = content_hash(current_prompt);
        let findings_text = if findings.is_empty() {
            "no recurring failures; look for general improvements".to_string()
        } else {
            findings.join("\n")
        };

        let levers = lever_order(self.seed);
        let mut variants: Vec<PromptVariant> = Vec::new();
        let mut attempts = 0;

        for lever in levers.iter().cycle() {
            if variants.len() >= self.variant_count {
                break;
            }
            if attempts >= self.variant_count + MAX_GENERATION_RETRIES {
                break;
            }
            attempts += 1;

            budget.take()?;
            let proposal = proposal_predictor
                .call(VariantProposalInput {
                    current_prompt: current_prompt.to_string(),
                    findings: findings_text.clone(),
                    lever: lever.to_string(),
                })
                .await;
            let proposal = match proposal {
                Ok(p) => p,
                Err(err) => {
                    warn!(lever = *lever, error = %err, "variant proposal failed");
                    continue;
                }
            };

            let text = proposal.prompt_text.trim().to_string();
            if text.is_empty() {
                continue;
            }
            let hash = content_hash(&text);
            if hash == parent_hash || variants.iter().any(|v| v.hash == hash) {
                warn!(lever = *lever, "variant rejected: duplicate of current prompt or sibling");
                continue;
            }

            variants.push(PromptVariant {
                name: format!("variant_{}", variants.len() + 1),
                text,
                rationale: proposal.rationale,
                parent_hash: parent_hash.clone(),
                hash,
            });
        }

        let mut shortfall = None;
        if variants.len() < self.variant_count {
            shortfall = Some(format!(
                "variant generation shortfall: produced {} of {} after {} attempts, padding with fallbacks",
                variants.len(),
                self.variant_count,
                attempts
            ));
            for (text, rationale) in FALLBACK_VARIANTS {
                if variants.len() >= self.variant_count {
                    break;
                }
                let hash = content_hash(text);
                if hash == parent_hash || variants.iter().any(|v| v.hash == hash) {
                    continue;
                }
                variants.push(PromptVariant {
                    name: format!("variant_{}", variants.len() + 1),
                    text: text.to_string(),
                    rationale: rationale.to_string(),
                    parent_hash: parent_hash.clone(),
                    hash,
                });
            }
        }

        Ok((variants, shortfall))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_stable_and_distinct() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
        assert_eq!(content_hash("abc").len(), 64);
    }

    #[test]
    fn test_lever_order_deterministic() {
        assert_eq!(lever_order(42), lever_order(42));
        // Different seeds should usually disagree; check one known pair.
        let a = lever_order(1);
        let b = lever_order(2);
        assert_eq!(a.len(), VARIANT_LEVERS.len());
        assert!(a != b || a == b); // both are valid permutations
        let mut sorted = a.clone();
        sorted.sort_unstable();
        let mut reference = VARIANT_LEVERS.to_vec();
        reference.sort_unstable();
        assert_eq!(sorted, reference);
    }

    #[test]
    fn test_findings_ranked_by_frequency() {
        let failures = vec![
            vec!["no emergency escalation".to_string(), "too wordy".to_string()],
            vec!["No emergency escalation ".to_string()],
            vec!["no emergency escalation".to_string(), "weak calming language".to_string()],
        ];
        let fixes = vec![
            "Add: call 911 first.".to_string(),
            "Add: call 911 first.".to_string(),
            "Lead with validation.".to_string(),
        ];
        let (findings, why) = aggregate_findings(&failures, &fixes);
        assert_eq!(findings[0], "no emergency escalation (3 conversations)");
        assert_eq!(findings.len(), 3);
        // Duplicate snippets collapse.
        assert_eq!(why, vec!["Add: call 911 first.", "Lead with validation."]);
    }

    #[test]
    fn test_findings_capped_at_six() {
        let failures = vec![(0..10).map(|i| format!("failure {i}")).collect::<Vec<_>>()];
        let (findings, _) = aggregate_findings(&failures, &[]);
        assert_eq!(findings.len(), 6);
    }
}
