use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::generate_id;

/// What kind of human decision a checkpoint is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    RetryExhausted,
    AmbiguousRequirement,
    BudgetApproval,
    VerificationFailed,
}

impl CheckpointType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RetryExhausted => "retry_exhausted",
            Self::AmbiguousRequirement => "ambiguous_requirement",
            Self::BudgetApproval => "budget_approval",
            Self::VerificationFailed => "verification_failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "retry_exhausted" => Self::RetryExhausted,
            "ambiguous_requirement" => Self::AmbiguousRequirement,
            "budget_approval" => Self::BudgetApproval,
            "verification_failed" => Self::VerificationFailed,
            _ => return None,
        })
    }
}

/// One failed attempt recorded against a task before a checkpoint was raised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub retry_count: u32,
    pub error: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub project_id: String,
    pub task_id: String,
    pub checkpoint_type: CheckpointType,
    pub summary: String,
    pub attempts: Vec<Attempt>,
    pub question: String,
    pub response: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn new(
        project_id: impl Into<String>,
        task_id: impl Into<String>,
        checkpoint_type: CheckpointType,
        summary: impl Into<String>,
        question: impl Into<String>,
    ) -> Self {
        let task_id = task_id.into();
        Self {
            id: generate_id("checkpoint", &task_id),
            project_id: project_id.into(),
            task_id,
            checkpoint_type,
            summary: summary.into(),
            attempts: Vec::new(),
            question: question.into(),
            response: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    pub fn resolve(&mut self, response: impl Into<String>) {
        self.response = Some(response.into());
        self.resolved_at = Some(Utc::now());
    }
}
