use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A progress-bus frame persisted for replay/audit. `event_type` is a short
/// tag like `task_started`, `task_completed`, `checkpoint_raised`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub id: i64,
    pub project_id: String,
    pub task_id: Option<String>,
    pub event_type: String,
    pub message: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl TaskEvent {
    pub fn new(
        project_id: impl Into<String>,
        task_id: Option<String>,
        event_type: impl Into<String>,
        message: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: 0,
            project_id: project_id.into(),
            task_id,
            event_type: event_type.into(),
            message: message.into(),
            data,
            created_at: Utc::now(),
        }
    }
}
