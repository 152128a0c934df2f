use rusqlite::{params, Connection};

use crate::domain::{BudgetPeriod, GLOBAL_PERIOD_SCOPE};
use crate::error::Result;

/// One transaction: append a usage-log row, upsert the global daily/monthly
/// period aggregates (keyed by [`GLOBAL_PERIOD_SCOPE`]) plus a per-project
/// breakdown row alongside them. Called from inside `BudgetManager::record`'s
/// lock.
pub fn record_spend(
    conn: &Connection,
    project_id: &str,
    task_id: Option<&str>,
    provider: &str,
    model: &str,
    prompt_tokens: i64,
    completion_tokens: i64,
    cost_usd: f64,
    purpose: &str,
    daily_key: &str,
    monthly_key: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO usage_log (project_id, task_id, provider, model, prompt_tokens, completion_tokens, cost_usd, purpose, created_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
        params![
            project_id,
            task_id,
            provider,
            model,
            prompt_tokens,
            completion_tokens,
            cost_usd,
            purpose,
            chrono::Utc::now().to_rfc3339(),
        ],
    )?;

    upsert_period(conn, GLOBAL_PERIOD_SCOPE, "daily", daily_key, cost_usd)?;
    upsert_period(conn, GLOBAL_PERIOD_SCOPE, "monthly", monthly_key, cost_usd)?;
    upsert_period(conn, project_id, "daily", daily_key, cost_usd)?;
    upsert_period(conn, project_id, "monthly", monthly_key, cost_usd)?;
    Ok(())
}

fn upsert_period(conn: &Connection, project_id: &str, period_type: &str, period_key: &str, cost_usd: f64) -> Result<()> {
    conn.execute(
        "INSERT INTO budget_periods (project_id, period_type, period_key, spent_usd, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (project_id, period_type, period_key)
         DO UPDATE SET spent_usd = spent_usd + excluded.spent_usd, updated_at = excluded.updated_at",
        params![project_id, period_type, period_key, cost_usd, chrono::Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

pub fn get_period(conn: &Connection, project_id: &str, period_type: &str, period_key: &str) -> Result<Option<BudgetPeriod>> {
    let mut stmt = conn.prepare(
        "SELECT project_id, period_key, spent_usd, limit_usd, updated_at
         FROM budget_periods WHERE project_id = ?1 AND period_type = ?2 AND period_key = ?3",
    )?;
    let mut rows = stmt.query(params![project_id, period_type, period_key])?;
    match rows.next()? {
        Some(row) => Ok(Some(BudgetPeriod {
            project_id: row.get(0)?,
            period_key: row.get(1)?,
            spent_usd: row.get(2)?,
            reserved_usd: 0.0,
            limit_usd: row.get(3)?,
            updated_at: super::parse_ts(&row.get::<_, String>(4)?),
        })),
        None => Ok(None),
    }
}

/// Aggregate spend across the whole project, independent of period.
pub fn total_spend_by_project(conn: &Connection, project_id: &str) -> Result<f64> {
    let total: Option<f64> = conn.query_row(
        "SELECT SUM(cost_usd) FROM usage_log WHERE project_id = ?1",
        params![project_id],
        |row| row.get(0),
    )?;
    Ok(total.unwrap_or(0.0))
}
