/// Cost per token (USD) used when neither the adapter config nor the
/// provider table knows a rate.
pub const FALLBACK_COST_PER_TOKEN: f64 = 0.00002;

/// Expected output tokens per input token when estimating a step up front.
const OUTPUT_TOKENS_PER_INPUT_TOKEN: u64 = 2;

/// Estimate token count for a text string using 4 chars/token heuristic.
///
/// Counts chars, not bytes, so non-ASCII task text is not over-estimated.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Estimated total tokens (prompt plus expected completion) for one step.
pub fn estimate_step_tokens(task_text: &str) -> u64 {
    let input = estimate_tokens(task_text);
    input + input * OUTPUT_TOKENS_PER_INPUT_TOKEN
}

/// Estimated cost in USD of running `task_text` at `cost_per_token`.
pub fn estimate_step_cost(task_text: &str, cost_per_token: f64) -> f64 {
    estimate_step_tokens(task_text) as f64 * cost_per_token
}

/// Return the per-token rate for a known provider/model pair.
///
/// A model-specific rate wins over the provider default. Unknown providers
/// return `None`; callers fall back to [`FALLBACK_COST_PER_TOKEN`].
pub fn provider_cost_per_token(provider: &str, model: Option<&str>) -> Option<f64> {
    if let Some(rate) = model.and_then(|m| model_rate(provider, m)) {
        return Some(rate);
    }
    match provider {
        "openai" => Some(0.00003),
        "anthropic" => Some(0.000025),
        "gemini" => Some(0.00004),
        "ollama" | "local" => Some(0.000001),
        _ => None,
    }
}

fn model_rate(provider: &str, model: &str) -> Option<f64> {
    match (provider, model) {
        ("openai", "gpt-4-turbo") => Some(0.00006),
        ("openai", "gpt-4") => Some(0.0002),
        ("openai", "gpt-4o-mini") => Some(0.0000006),
        ("anthropic", "claude-3-haiku-20240307") => Some(0.00000125),
        ("anthropic", "claude-sonnet-4-20250514") => Some(0.000015),
        _ => None,
    }
}

/// Resolve a seed rate: explicit override, then provider table, then fallback.
pub fn resolve_cost_per_token(explicit: Option<f64>, provider: &str, model: Option<&str>) -> f64 {
    explicit
        .or_else(|| provider_cost_per_token(provider, model))
        .unwrap_or(FALLBACK_COST_PER_TOKEN)
}
