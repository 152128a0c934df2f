//! Static per-model USD/M-token pricing, used to turn a completion's token
//! usage into a cost. Unknown models cost $0.00 and log a once-per-model
//! warning (not per-call, to avoid log spam on a misconfigured model id).

use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

struct Pricing {
    input_per_mtok: f64,
    output_per_mtok: f64,
}

const TABLE: &[(&str, Pricing)] = &[
    ("claude-haiku-4-5-20251001", Pricing { input_per_mtok: 1.0, output_per_mtok: 5.0 }),
    ("claude-sonnet-4-6", Pricing { input_per_mtok: 3.0, output_per_mtok: 15.0 }),
    ("claude-sonnet-4-20250514", Pricing { input_per_mtok: 3.0, output_per_mtok: 15.0 }),
    ("claude-opus-4-6", Pricing { input_per_mtok: 15.0, output_per_mtok: 75.0 }),
];

fn warned_models() -> &'static Mutex<HashSet<String>> {
    static WARNED_MODELS: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    WARNED_MODELS.get_or_init(|| Mutex::new(HashSet::new()))
}

/// USD cost of a completion, given its model id and token counts.
pub fn calculate_cost(model: &str, prompt_tokens: i64, completion_tokens: i64) -> f64 {
    match TABLE.iter().find(|(name, _)| *name == model) {
        Some((_, pricing)) => {
            let input_cost = (prompt_tokens as f64 / 1_000_000.0) * pricing.input_per_mtok;
            let output_cost = (completion_tokens as f64 / 1_000_000.0) * pricing.output_per_mtok;
            ((input_cost + output_cost) * 1_000_000.0).round() / 1_000_000.0
        }
        None => {
            warn_unknown_model_once(model);
            0.0
        }
    }
}

fn warn_unknown_model_once(model: &str) {
    let mut warned = warned_models().lock().expect("warned-models mutex poisoned");
    if warned.insert(model.to_string()) {
        tracing::warn!(model, "unknown model, cost recorded as $0.00");
    }
}

/// Map a model tier to the concrete model id billed for it. `None` for the
/// free local tier, which never reaches this pricing table.
pub fn model_id_for_tier(tier: crate::domain::ModelTier) -> Option<&'static str> {
    use crate::domain::ModelTier;
    match tier {
        ModelTier::Ollama => None,
        ModelTier::Haiku => Some("claude-haiku-4-5-20251001"),
        ModelTier::Sonnet => Some("claude-sonnet-4-6"),
        ModelTier::Opus => Some("claude-opus-4-6"),
    }
}

/// Rough upfront cost estimate used to size a reservation before dispatch.
/// Zero for the free local tier.
pub fn estimate_task_cost(tier: crate::domain::ModelTier, estimated_input_tokens: i64, max_output_tokens: i64) -> f64 {
    match model_id_for_tier(tier) {
        Some(model) => calculate_cost(model, estimated_input_tokens, max_output_tokens),
        None => 0.0,
    }
}
