//! `(task_type, complexity) -> ModelTier` and `task_type -> tool set` lookup
//! tables. Grounded on the model router's tier-recommendation and
//! tools-by-task-type maps; tool names are adapted to this crate's actual
//! registered tool set rather than the router's original tool names.

use crate::domain::ModelTier;

/// Recommended tier for a `(task_type, complexity)` pair. Unmapped
/// combinations fall back to `Haiku` rather than the cheapest tier, so an
/// unrecognized task type doesn't silently run on local inference.
pub fn model_tier_for(task_type: &str, complexity: &str) -> ModelTier {
    match (task_type, complexity) {
        ("code", "simple") => ModelTier::Haiku,
        ("code", "medium") => ModelTier::Sonnet,
        ("code", "complex") => ModelTier::Sonnet,

        ("research", "simple") => ModelTier::Ollama,
        ("research", "medium") => ModelTier::Haiku,
        ("research", "complex") => ModelTier::Sonnet,

        ("analysis", "simple") => ModelTier::Ollama,
        ("analysis", "medium") => ModelTier::Haiku,
        ("analysis", "complex") => ModelTier::Sonnet,

        ("asset", "simple") => ModelTier::Ollama,
        ("asset", "medium") => ModelTier::Ollama,
        ("asset", "complex") => ModelTier::Ollama,

        ("integration", "simple") => ModelTier::Haiku,
        ("integration", "medium") => ModelTier::Haiku,
        ("integration", "complex") => ModelTier::Sonnet,

        ("documentation", "simple") => ModelTier::Ollama,
        ("documentation", "medium") => ModelTier::Haiku,
        ("documentation", "complex") => ModelTier::Sonnet,

        _ => ModelTier::Haiku,
    }
}

/// Recommended tool set for a task type, drawn from this crate's registered
/// tool names (see `tools::ToolExecutor::standard`).
pub fn default_tools(task_type: &str) -> Vec<String> {
    let names: &[&str] = match task_type {
        "code" => &["read", "write", "grep", "glob"],
        "research" => &["grep", "glob", "read"],
        "analysis" => &["read", "grep", "glob"],
        "asset" => &["write", "read"],
        "integration" => &["read", "write", "list"],
        "documentation" => &["read", "write", "grep"],
        _ => &["read", "grep"],
    };
    names.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_complexity_escalates_to_sonnet() {
        assert_eq!(model_tier_for("code", "simple"), ModelTier::Haiku);
        assert_eq!(model_tier_for("code", "medium"), ModelTier::Sonnet);
        assert_eq!(model_tier_for("code", "complex"), ModelTier::Sonnet);
    }

    #[test]
    fn asset_always_runs_local() {
        assert_eq!(model_tier_for("asset", "complex"), ModelTier::Ollama);
    }

    #[test]
    fn unknown_task_type_falls_back_to_haiku() {
        assert_eq!(model_tier_for("unknown", "complex"), ModelTier::Haiku);
    }

    #[test]
    fn default_tools_cover_code_basics() {
        let tools = default_tools("code");
        assert!(tools.contains(&"write".to_string()));
        assert!(tools.contains(&"grep".to_string()));
    }

    #[test]
    fn unknown_task_type_gets_minimal_tools() {
        assert_eq!(default_tools("mystery"), vec!["read".to_string(), "grep".to_string()]);
    }
}
