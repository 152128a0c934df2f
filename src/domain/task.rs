use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::generate_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Blocked,
    Queued,
    Running,
    Completed,
    NeedsReview,
    Failed,
    Cancelled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Blocked => "blocked",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::NeedsReview => "needs_review",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "blocked" => Self::Blocked,
            "queued" => Self::Queued,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "needs_review" => Self::NeedsReview,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::NeedsReview | Self::Failed | Self::Cancelled)
    }
}

/// Cheapest tier that can handle a task; `Ollama` is free/local, the rest are paid remote tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Ollama,
    Haiku,
    Sonnet,
    Opus,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::Haiku => "haiku",
            Self::Sonnet => "sonnet",
            Self::Opus => "opus",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "ollama" => Self::Ollama,
            "haiku" => Self::Haiku,
            "sonnet" => Self::Sonnet,
            "opus" => Self::Opus,
            _ => return None,
        })
    }

    pub fn is_paid(&self) -> bool {
        !matches!(self, Self::Ollama)
    }
}

/// A typed entry in a task's accumulated context list. `kind` is one of
/// `dependency_output`, `verification_feedback`, `checkpoint_guidance`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEntry {
    pub kind: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ContextEntry {
    pub fn new(kind: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub plan_id: String,
    pub title: String,
    pub description: String,
    pub task_type: String,
    pub model_tier: ModelTier,
    pub priority: i32,
    pub wave: i32,
    pub phase: Option<String>,
    pub tools: Vec<String>,
    pub context: Vec<ContextEntry>,
    pub status: TaskStatus,
    pub output_text: Option<String>,
    pub artifacts: Vec<String>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cost_usd: f64,
    pub retry_count: u32,
    pub model_used: Option<String>,
    pub verification_criteria: Option<String>,
    pub affected_files: Vec<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project_id: impl Into<String>,
        plan_id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        task_type: impl Into<String>,
        model_tier: ModelTier,
        priority: i32,
    ) -> Self {
        let title = title.into();
        let now = Utc::now();
        Self {
            id: generate_id("task", &title),
            project_id: project_id.into(),
            plan_id: plan_id.into(),
            title,
            description: description.into(),
            task_type: task_type.into(),
            model_tier,
            priority,
            wave: 0,
            phase: None,
            tools: Vec::new(),
            context: Vec::new(),
            status: TaskStatus::Pending,
            output_text: None,
            artifacts: Vec::new(),
            prompt_tokens: 0,
            completion_tokens: 0,
            cost_usd: 0.0,
            retry_count: 0,
            model_used: None,
            verification_criteria: None,
            affected_files: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    pub fn push_context(&mut self, entry: ContextEntry) {
        self.context.push(entry);
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_starts_pending_at_wave_zero() {
        let t = Task::new("proj-1", "plan-1", "Do thing", "desc", "code", ModelTier::Haiku, 10);
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.wave, 0);
        assert!(!t.status.is_terminal());
    }

    #[test]
    fn model_tier_paid_flag() {
        assert!(!ModelTier::Ollama.is_paid());
        assert!(ModelTier::Haiku.is_paid());
        assert!(ModelTier::Sonnet.is_paid());
        assert!(ModelTier::Opus.is_paid());
    }

    #[test]
    fn terminal_statuses() {
        for s in [TaskStatus::Completed, TaskStatus::NeedsReview, TaskStatus::Failed, TaskStatus::Cancelled] {
            assert!(s.is_terminal());
        }
        for s in [TaskStatus::Pending, TaskStatus::Blocked, TaskStatus::Queued, TaskStatus::Running] {
            assert!(!s.is_terminal());
        }
    }
}
