//! LLM configuration and per-tick call budgeting
//!
//! Two models are in play: the agent/generator model that the candidate
//! prompts run against, and the judge model used for scoring and reflection.
//! Both are built once at startup; the global predictor config is switched
//! between them at phase boundaries, never mid-phase.

use anyhow::Result;
use dspy_rs::{configure, ChatAdapter, LM};
use std::sync::atomic::{AtomicU32, Ordering};

/// Build an `LM` handle against the configured gateway.
pub async fn build_lm(api_url: &str, api_key: &str, model: &str, temperature: f32) -> Result<LM> {
    let lm = LM::builder()
        .base_url(api_url.to_string())
        .api_key(api_key.to_string())
        .model(model.to_string())
        .temperature(temperature)
        .max_tokens(8192)
        .build()
        .await?;
    Ok(lm)
}

/// Make `lm` the active model for subsequent predictor calls.
pub fn activate(lm: LM) {
    configure(lm, ChatAdapter);
}

#[derive(Debug, thiserror::Error)]
#[error("per-tick LLM call budget exhausted")]
pub struct BudgetExhausted;

/// Counts LLM calls within one tick. When the budget runs out the current
/// phase aborts cleanly and the worker enters WAITING with
/// `reason = "rate_limited"`; artifacts already written are kept.
pub struct LlmBudget {
    remaining: AtomicU32,
}

impl LlmBudget {
    pub fn new(limit: u32) -> Self {
        Self {
            remaining: AtomicU32::new(limit),
        }
    }

    /// Reserve one call. Fails once the budget is spent.
    pub fn take(&self) -> Result<(), BudgetExhausted> {
        let mut current = self.remaining.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return Err(BudgetExhausted);
            }
            match self.remaining.compare_exchange(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_exhaustion() {
        let budget = LlmBudget::new(2);
        assert!(budget.take().is_ok());
        assert!(budget.take().is_ok());
        assert!(budget.take().is_err());
        assert_eq!(budget.remaining(), 0);
    }
}
