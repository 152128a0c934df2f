//! Agent runners: the two ways a task's model tier gets turned into
//! output. A `Haiku`/`Sonnet`/`Opus` task runs a multi-round tool-use loop
//! against the remote LLM ([`remote::RemoteAgent`]); an `Ollama` task is a
//! single POST to a local inference host ([`local::LocalAgent`]). Grounded
//! on the Anthropic client's request/response shape and the Resource
//! Monitor's ollama-endpoint convention.

pub mod local;
pub mod remote;

pub use local::LocalAgent;
pub use remote::RemoteAgent;

use crate::domain::Task;

/// Result of running a task to completion (or partial completion) through
/// either agent runner. Fields mirror what `task_repo::record_output`
/// persists.
#[derive(Debug, Clone, Default)]
pub struct AgentOutput {
    pub output: Option<String>,
    pub artifacts: Vec<String>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cost_usd: f64,
    pub model_used: String,
}

/// System prompt shared by both runners: task framing plus every
/// accumulated context entry (briefs, dependency output, verification
/// feedback, checkpoint guidance), rendered in the order they were
/// appended so later entries read as the most recent instruction.
pub fn render_system_prompt(task: &Task) -> String {
    let mut sections = vec![format!(
        "You are an autonomous task-execution agent. Complete the following task as instructed, then stop.\n\nTask: {}",
        task.title
    )];

    if let Some(criteria) = &task.verification_criteria {
        sections.push(format!("Verification criteria:\n{criteria}"));
    }

    for entry in &task.context {
        sections.push(format!("[{}]\n{}", entry.kind, entry.content));
    }

    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ContextEntry, ModelTier};

    #[test]
    fn render_system_prompt_includes_context_entries_in_order() {
        let mut task = Task::new("proj-1", "plan-1", "Write docs", "desc", "documentation", ModelTier::Haiku, 1);
        task.push_context(ContextEntry::new("task_brief", "{\"summary\":\"s\"}"));
        task.push_context(ContextEntry::new("dependency_output", "upstream result"));

        let prompt = render_system_prompt(&task);
        let brief_idx = prompt.find("task_brief").unwrap();
        let dep_idx = prompt.find("dependency_output").unwrap();
        assert!(brief_idx < dep_idx);
        assert!(prompt.contains("Write docs"));
    }
}
