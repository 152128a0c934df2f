//! Spend tracking and limit enforcement.
//!
//! `BudgetManager` wraps a [`Store`](crate::store::Store) and an in-memory
//! reservation table behind a single async mutex, so a reserve-then-dispatch
//! sequence never races another task's reserve-then-dispatch: whoever grabs
//! the lock first sees the other's reservation before committing its own.
//! The reservations live only in memory and are approximate — a task
//! reserved just before midnight and recorded just after leaves a stale
//! daily reservation bounded by `max_concurrent_tasks * one task's cost`,
//! which clears itself on the next rollover.

pub mod pricing;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::BudgetConfig;
use crate::error::Result;
use crate::store::{usage_repo, Store};

fn today_key() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

fn month_key() -> String {
    Utc::now().format("%Y-%m").to_string()
}

struct Reservations {
    daily_key: String,
    monthly_key: String,
    reserved_daily: f64,
    reserved_monthly: f64,
    reserved_per_project: HashMap<String, f64>,
}

impl Reservations {
    fn new() -> Self {
        Self {
            daily_key: today_key(),
            monthly_key: month_key(),
            reserved_daily: 0.0,
            reserved_monthly: 0.0,
            reserved_per_project: HashMap::new(),
        }
    }

    /// Reset reservations whose period rolled over since the last check.
    /// A day rollover also clears the per-project map — the per-project
    /// limit is not period-scoped in config, but resetting alongside the
    /// daily reservation avoids an indefinitely-growing map of projects
    /// whose reservations were already released and forgotten.
    fn refresh(&mut self) {
        let day = today_key();
        let month = month_key();
        if day != self.daily_key {
            self.daily_key = day;
            self.reserved_daily = 0.0;
            self.reserved_per_project.clear();
        }
        if month != self.monthly_key {
            self.monthly_key = month;
            self.reserved_monthly = 0.0;
        }
    }
}

/// One status snapshot for a single period (daily or monthly).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodStatus {
    pub period_key: String,
    pub spent_usd: f64,
    pub reserved_usd: f64,
    pub limit_usd: f64,
    pub warning: bool,
}

impl PeriodStatus {
    fn committed(&self) -> f64 {
        self.spent_usd + self.reserved_usd
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub daily: PeriodStatus,
    pub monthly: PeriodStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelUsage {
    pub cost_usd: f64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub calls: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub cost_usd: f64,
    pub calls: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSummary {
    pub project_id: Option<String>,
    pub total_cost_usd: f64,
    pub total_prompt_tokens: i64,
    pub total_completion_tokens: i64,
    pub api_call_count: i64,
    pub by_model: HashMap<String, ModelUsage>,
    pub by_provider: HashMap<String, ProviderUsage>,
}

/// Tracks spend against the configured daily, monthly, and per-project
/// limits, and records each billable call. Grounded on the Python
/// `BudgetManager`, generalized to a single `tokio::sync::Mutex` guarding
/// both the global and per-project reservation state (the original uses one
/// `asyncio.Lock` for the same purpose).
pub struct BudgetManager {
    store: Arc<Store>,
    config: BudgetConfig,
    reservations: Mutex<Reservations>,
}

impl BudgetManager {
    pub fn new(store: Arc<Store>, config: BudgetConfig) -> Self {
        Self { store, config, reservations: Mutex::new(Reservations::new()) }
    }

    fn spent(&self, period_type: &str, period_key: &str) -> Result<f64> {
        self.store.with_conn(|conn| {
            Ok(usage_repo::get_period(conn, crate::domain::GLOBAL_PERIOD_SCOPE, period_type, period_key)?
                .map(|p| p.spent_usd)
                .unwrap_or(0.0))
        })
    }

    /// Reserve `cost` against both the daily and monthly limits. Returns
    /// `false` (reserving nothing) if either limit would be exceeded. A
    /// non-positive cost (the free local tier) always succeeds without
    /// touching the reservation state.
    pub async fn reserve(&self, cost: f64) -> Result<bool> {
        if cost <= 0.0 {
            return Ok(true);
        }

        let mut res = self.reservations.lock().await;
        res.refresh();

        let daily_spent = self.spent("daily", &res.daily_key)?;
        let monthly_spent = self.spent("monthly", &res.monthly_key)?;

        let daily_ok = daily_spent + res.reserved_daily + cost <= self.config.daily_limit_usd;
        let monthly_ok = monthly_spent + res.reserved_monthly + cost <= self.config.monthly_limit_usd;
        if !(daily_ok && monthly_ok) {
            return Ok(false);
        }

        res.reserved_daily += cost;
        res.reserved_monthly += cost;
        Ok(true)
    }

    pub async fn release(&self, cost: f64) {
        if cost <= 0.0 {
            return;
        }
        let mut res = self.reservations.lock().await;
        res.reserved_daily = (res.reserved_daily - cost).max(0.0);
        res.reserved_monthly = (res.reserved_monthly - cost).max(0.0);
    }

    /// Check (without reserving) whether a project has room for `cost`
    /// under its per-project limit. Used by callers that only need a
    /// yes/no read, e.g. surfacing a warning before a plan is decomposed.
    pub fn can_spend_project(&self, project_id: &str, cost: f64) -> Result<bool> {
        if cost <= 0.0 {
            return Ok(true);
        }
        let spent = self.store.with_conn(|conn| usage_repo::total_spend_by_project(conn, project_id))?;
        Ok(spent + cost <= self.config.project_limit_usd)
    }

    /// Reserve `cost` against a single project's limit. Must be called
    /// after [`reserve`](Self::reserve) has already granted the global
    /// reservation — on refusal, the caller is responsible for releasing
    /// that global reservation.
    pub async fn reserve_project(&self, project_id: &str, cost: f64) -> Result<bool> {
        if cost <= 0.0 {
            return Ok(true);
        }

        let mut res = self.reservations.lock().await;
        res.refresh();

        let spent = self.store.with_conn(|conn| usage_repo::total_spend_by_project(conn, project_id))?;
        let reserved = res.reserved_per_project.get(project_id).copied().unwrap_or(0.0);
        if spent + reserved + cost > self.config.project_limit_usd {
            return Ok(false);
        }

        res.reserved_per_project.insert(project_id.to_string(), reserved + cost);
        Ok(true)
    }

    pub async fn release_project(&self, project_id: &str, cost: f64) {
        if cost <= 0.0 {
            return;
        }
        let mut res = self.reservations.lock().await;
        let reserved = res.reserved_per_project.get(project_id).copied().unwrap_or(0.0);
        res.reserved_per_project.insert(project_id.to_string(), (reserved - cost).max(0.0));
    }

    /// Record a completed call's actual cost and tokens, then release the
    /// matching reservations. Call this (or `release`/`release_project`
    /// alone, on failure) exactly once per reserved call.
    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
        cost_usd: f64,
        prompt_tokens: i64,
        completion_tokens: i64,
        provider: &str,
        model: &str,
        purpose: &str,
        project_id: &str,
        task_id: Option<&str>,
    ) -> Result<()> {
        let daily_key = today_key();
        let monthly_key = month_key();
        self.store.with_conn(|conn| {
            usage_repo::record_spend(
                conn,
                project_id,
                task_id,
                provider,
                model,
                prompt_tokens,
                completion_tokens,
                cost_usd,
                purpose,
                &daily_key,
                &monthly_key,
            )
        })?;

        self.release(cost_usd).await;
        self.release_project(project_id, cost_usd).await;
        Ok(())
    }

    /// Current spend/limit/warning snapshot for both periods.
    pub async fn status(&self) -> Result<BudgetStatus> {
        let mut res = self.reservations.lock().await;
        res.refresh();

        let daily_spent = self.spent("daily", &res.daily_key)?;
        let monthly_spent = self.spent("monthly", &res.monthly_key)?;
        let threshold = self.config.warning_threshold;

        let daily = PeriodStatus {
            period_key: res.daily_key.clone(),
            spent_usd: daily_spent,
            reserved_usd: res.reserved_daily,
            limit_usd: self.config.daily_limit_usd,
            warning: false,
        };
        let monthly = PeriodStatus {
            period_key: res.monthly_key.clone(),
            spent_usd: monthly_spent,
            reserved_usd: res.reserved_monthly,
            limit_usd: self.config.monthly_limit_usd,
            warning: false,
        };
        drop(res);

        let daily_warning = is_warning(&daily, threshold);
        let monthly_warning = is_warning(&monthly, threshold);
        Ok(BudgetStatus {
            daily: PeriodStatus { warning: daily_warning, ..daily },
            monthly: PeriodStatus { warning: monthly_warning, ..monthly },
        })
    }

    /// `true` if either period is at or above the configured warning
    /// threshold, counting outstanding reservations as committed spend.
    pub async fn is_warning(&self) -> Result<bool> {
        let status = self.status().await?;
        Ok(status.daily.warning || status.monthly.warning)
    }

    /// Aggregate usage, optionally scoped to one project.
    pub fn summary(&self, project_id: Option<&str>) -> Result<UsageSummary> {
        self.store.with_conn(|conn| {
            let (total_cost, prompt_tokens, completion_tokens, calls): (f64, i64, i64, i64) = match project_id {
                Some(pid) => conn.query_row(
                    "SELECT COALESCE(SUM(cost_usd),0), COALESCE(SUM(prompt_tokens),0), COALESCE(SUM(completion_tokens),0), COUNT(*)
                     FROM usage_log WHERE project_id = ?1",
                    rusqlite::params![pid],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
                )?,
                None => conn.query_row(
                    "SELECT COALESCE(SUM(cost_usd),0), COALESCE(SUM(prompt_tokens),0), COALESCE(SUM(completion_tokens),0), COUNT(*)
                     FROM usage_log",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
                )?,
            };

            let mut by_model = HashMap::new();
            let mut stmt = match project_id {
                Some(_) => conn.prepare(
                    "SELECT model, SUM(cost_usd), SUM(prompt_tokens), SUM(completion_tokens), COUNT(*)
                     FROM usage_log WHERE project_id = ?1 GROUP BY model",
                )?,
                None => conn.prepare(
                    "SELECT model, SUM(cost_usd), SUM(prompt_tokens), SUM(completion_tokens), COUNT(*)
                     FROM usage_log GROUP BY model",
                )?,
            };
            let rows = if let Some(pid) = project_id {
                stmt.query_map(rusqlite::params![pid], row_to_model_usage)?
            } else {
                stmt.query_map([], row_to_model_usage)?
            };
            for row in rows {
                let (model, usage) = row?;
                by_model.insert(model, usage);
            }

            let mut by_provider = HashMap::new();
            let mut stmt = match project_id {
                Some(_) => conn.prepare(
                    "SELECT provider, SUM(cost_usd), COUNT(*) FROM usage_log WHERE project_id = ?1 GROUP BY provider",
                )?,
                None => conn.prepare("SELECT provider, SUM(cost_usd), COUNT(*) FROM usage_log GROUP BY provider")?,
            };
            let rows = if let Some(pid) = project_id {
                stmt.query_map(rusqlite::params![pid], row_to_provider_usage)?
            } else {
                stmt.query_map([], row_to_provider_usage)?
            };
            for row in rows {
                let (provider, usage) = row?;
                by_provider.insert(provider, usage);
            }

            Ok(UsageSummary {
                project_id: project_id.map(String::from),
                total_cost_usd: total_cost,
                total_prompt_tokens: prompt_tokens,
                total_completion_tokens: completion_tokens,
                api_call_count: calls,
                by_model,
                by_provider,
            })
        })
    }
}

fn is_warning(period: &PeriodStatus, threshold: f64) -> bool {
    period.limit_usd > 0.0 && period.committed() / period.limit_usd >= threshold
}

fn row_to_model_usage(row: &rusqlite::Row) -> rusqlite::Result<(String, ModelUsage)> {
    Ok((
        row.get(0)?,
        ModelUsage { cost_usd: row.get(1)?, prompt_tokens: row.get(2)?, completion_tokens: row.get(3)?, calls: row.get(4)? },
    ))
}

fn row_to_provider_usage(row: &rusqlite::Row) -> rusqlite::Result<(String, ProviderUsage)> {
    Ok((row.get(0)?, ProviderUsage { cost_usd: row.get(1)?, calls: row.get(2)? }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Project;
    use crate::store::project_repo;

    fn manager(store: Arc<Store>, daily: f64, monthly: f64, per_project: f64) -> BudgetManager {
        BudgetManager::new(
            store,
            BudgetConfig { daily_limit_usd: daily, monthly_limit_usd: monthly, project_limit_usd: per_project, warning_threshold: 0.8 },
        )
    }

    fn seed_project(store: &Store) -> Project {
        let project = Project::new("Widget app", "build a widget");
        store.with_conn(|conn| project_repo::create_project(conn, &project)).unwrap();
        project
    }

    #[tokio::test]
    async fn reserve_succeeds_under_limit_and_fails_over() {
        let store = Arc::new(Store::init_in_memory().unwrap());
        let mgr = manager(store, 10.0, 100.0, 100.0);

        assert!(mgr.reserve(6.0).await.unwrap());
        assert!(!mgr.reserve(5.0).await.unwrap());
        mgr.release(6.0).await;
        assert!(mgr.reserve(5.0).await.unwrap());
    }

    #[tokio::test]
    async fn zero_cost_always_reserves() {
        let store = Arc::new(Store::init_in_memory().unwrap());
        let mgr = manager(store, 1.0, 1.0, 1.0);
        assert!(mgr.reserve(0.0).await.unwrap());
        assert!(mgr.reserve_project("proj-x", 0.0).await.unwrap());
    }

    #[tokio::test]
    async fn record_updates_status_and_releases_reservation() {
        let store = Arc::new(Store::init_in_memory().unwrap());
        let project = seed_project(&store);
        let mgr = manager(store, 10.0, 100.0, 100.0);

        assert!(mgr.reserve(2.0).await.unwrap());
        assert!(mgr.reserve_project(&project.id, 2.0).await.unwrap());
        mgr.record(2.0, 100, 50, "anthropic", "claude-sonnet-4-6", "decompose", &project.id, None).await.unwrap();

        let status = mgr.status().await.unwrap();
        assert!((status.daily.spent_usd - 2.0).abs() < 1e-9);
        assert_eq!(status.daily.reserved_usd, 0.0);
    }

    #[tokio::test]
    async fn reserve_project_respects_per_project_limit() {
        let store = Arc::new(Store::init_in_memory().unwrap());
        let project = seed_project(&store);
        let mgr = manager(store, 1000.0, 1000.0, 5.0);

        assert!(mgr.reserve_project(&project.id, 3.0).await.unwrap());
        assert!(!mgr.reserve_project(&project.id, 3.0).await.unwrap());
        mgr.release_project(&project.id, 3.0).await;
        assert!(mgr.reserve_project(&project.id, 3.0).await.unwrap());
    }

    #[tokio::test]
    async fn is_warning_trips_at_threshold() {
        let store = Arc::new(Store::init_in_memory().unwrap());
        let project = seed_project(&store);
        let mgr = manager(store, 10.0, 100.0, 100.0);

        assert!(!mgr.is_warning().await.unwrap());
        assert!(mgr.reserve(9.0).await.unwrap());
        assert!(mgr.reserve_project(&project.id, 9.0).await.unwrap());
        mgr.record(9.0, 100, 50, "anthropic", "claude-sonnet-4-6", "decompose", &project.id, None).await.unwrap();
        assert!(mgr.is_warning().await.unwrap());
    }

    #[tokio::test]
    async fn summary_aggregates_by_model_and_provider() {
        let store = Arc::new(Store::init_in_memory().unwrap());
        let project = seed_project(&store);
        let mgr = manager(store, 1000.0, 1000.0, 1000.0);

        mgr.record(1.0, 100, 50, "anthropic", "claude-haiku-4-5-20251001", "decompose", &project.id, None).await.unwrap();
        mgr.record(2.0, 200, 100, "anthropic", "claude-sonnet-4-6", "execute", &project.id, None).await.unwrap();

        let summary = mgr.summary(Some(&project.id)).unwrap();
        assert!((summary.total_cost_usd - 3.0).abs() < 1e-9);
        assert_eq!(summary.api_call_count, 2);
        assert_eq!(summary.by_model.len(), 2);
        assert_eq!(summary.by_provider.get("anthropic").unwrap().calls, 2);
    }
}
