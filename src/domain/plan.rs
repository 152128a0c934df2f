use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::generate_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Draft,
    Approved,
    Superseded,
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Approved => "approved",
            Self::Superseded => "superseded",
        };
        write!(f, "{s}")
    }
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Approved => "approved",
            Self::Superseded => "superseded",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "draft" => Self::Draft,
            "approved" => Self::Approved,
            "superseded" => Self::Superseded,
            _ => return None,
        })
    }
}

/// A single planned task as produced by the Planner, before decomposition
/// assigns it an id, a wave, or a tool set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedTask {
    pub title: String,
    pub description: String,
    pub task_type: String,
    pub complexity: String,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub verification_criteria: Option<String>,
    #[serde(default)]
    pub affected_files: Vec<String>,
}

/// A phase groups planned tasks; global indices across phases are what
/// `depends_on` titles resolve against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedPhase {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub tasks: Vec<PlannedTask>,
}

/// The Planner's structured output, rigor-level-dependent in which optional
/// fields are populated (L1: tasks only; L2: phases + open_questions;
/// L3: phases + risks + test_strategy).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlanOutput {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub tasks: Vec<PlannedTask>,
    #[serde(default)]
    pub phases: Vec<PlannedPhase>,
    #[serde(default)]
    pub open_questions: Vec<String>,
    #[serde(default)]
    pub risks: Vec<String>,
    #[serde(default)]
    pub test_strategy: Option<String>,
}

impl PlanOutput {
    /// Flatten phases (if used) and the flat task list (if used) into a single
    /// ordered list, preserving global index order for dependency resolution.
    pub fn flatten(&self) -> Vec<(Option<&str>, &PlannedTask)> {
        if !self.phases.is_empty() {
            self.phases
                .iter()
                .flat_map(|p| p.tasks.iter().map(move |t| (Some(p.name.as_str()), t)))
                .collect()
        } else {
            self.tasks.iter().map(|t| (None, t)).collect()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub project_id: String,
    pub version: u32,
    pub status: PlanStatus,
    pub output: PlanOutput,
    pub rigor_level: u8,
    pub cost_usd: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(project_id: impl Into<String>, version: u32, output: PlanOutput, rigor_level: u8) -> Self {
        let project_id = project_id.into();
        let now = Utc::now();
        Self {
            id: generate_id("plan", &format!("{project_id}-v{version}")),
            project_id,
            version,
            status: PlanStatus::Draft,
            output,
            rigor_level,
            cost_usd: 0.0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: PlanStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}
