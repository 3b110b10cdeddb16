//! One priced LLM call, shared by the LLM-backed workers.

use super::session::SessionTally;
use super::{ExecutionError, WorkOutcome};
use crate::budget::{estimate_tokens, PricingInfo};
use crate::llm::{ChatMessage, LlmClient};

pub(super) struct Prompt<'a> {
    pub llm: &'a dyn LlmClient,
    pub model: &'a str,
    pub pricing: PricingInfo,
    pub system: &'a str,
    pub user: &'a str,
}

/// Send `prompt`, price what it used and record it in `tally`.
///
/// Spend is unknown (and nothing is recorded) if the provider never
/// answered. An empty answer is a failure that still reports its spend.
pub(super) async fn complete(prompt: Prompt<'_>, tally: &SessionTally) -> Result<WorkOutcome, ExecutionError> {
    let messages = [ChatMessage::system(prompt.system), ChatMessage::user(prompt.user)];
    let response = prompt
        .llm
        .chat_completion(prompt.model, &messages)
        .await
        .map_err(|e| ExecutionError::new(format!("LLM error: {}", e)))?;

    let tokens = match &response.usage {
        Some(usage) => usage.prompt_tokens.saturating_add(usage.completion_tokens),
        None => {
            // No usage data: count what we sent and what came back.
            let sent = estimate_tokens(prompt.system) + estimate_tokens(prompt.user);
            sent + response.content.as_deref().map(estimate_tokens).unwrap_or(0)
        }
    };
    let actual_cost_cents = prompt.pricing.cost_for_tokens(tokens);
    tally.record(tokens, actual_cost_cents);

    let output = response
        .content
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ExecutionError::new("LLM returned no content").with_cost(actual_cost_cents))?;

    Ok(WorkOutcome {
        actual_cost_cents,
        output,
        model_used: response.model.or_else(|| Some(prompt.model.to_string())),
    })
}
