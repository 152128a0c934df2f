use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One billable LLM call, recorded for audit and for rebuilding budget periods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLogEntry {
    pub id: i64,
    pub project_id: String,
    pub task_id: Option<String>,
    pub provider: String,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cost_usd: f64,
    pub purpose: String,
    pub created_at: DateTime<Utc>,
}

/// Sentinel `project_id` used for the global (cross-project) daily/monthly
/// aggregate rows, since `budget_periods.project_id` carries no FK and the
/// global rows are not scoped to any one project.
pub const GLOBAL_PERIOD_SCOPE: &str = "*";

/// A period-keyed running total. Global daily/monthly rows use
/// [`GLOBAL_PERIOD_SCOPE`] as `project_id`; additional per-project rows are
/// kept alongside them as a breakdown. `period_key` is `YYYY-MM-DD` for daily
/// rows and `YYYY-MM` for monthly rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetPeriod {
    pub project_id: String,
    pub period_key: String,
    pub spent_usd: f64,
    pub reserved_usd: f64,
    pub limit_usd: f64,
    pub updated_at: DateTime<Utc>,
}

impl BudgetPeriod {
    pub fn new(project_id: impl Into<String>, period_key: impl Into<String>, limit_usd: f64) -> Self {
        Self {
            project_id: project_id.into(),
            period_key: period_key.into(),
            spent_usd: 0.0,
            reserved_usd: 0.0,
            limit_usd,
            updated_at: Utc::now(),
        }
    }

    pub fn committed_usd(&self) -> f64 {
        self.spent_usd + self.reserved_usd
    }

    pub fn remaining_usd(&self) -> f64 {
        (self.limit_usd - self.committed_usd()).max(0.0)
    }

    pub fn is_warning(&self, threshold: f64) -> bool {
        self.limit_usd > 0.0 && self.committed_usd() / self.limit_usd >= threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_usd_floors_at_zero() {
        let mut p = BudgetPeriod::new("proj-1", "2026-07", 10.0);
        p.spent_usd = 12.0;
        assert_eq!(p.remaining_usd(), 0.0);
    }

    #[test]
    fn is_warning_trips_at_threshold() {
        let mut p = BudgetPeriod::new("proj-1", "2026-07", 10.0);
        p.spent_usd = 8.0;
        assert!(p.is_warning(0.8));
        assert!(!p.is_warning(0.9));
    }
}
