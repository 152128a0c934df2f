use rusqlite::{params, Connection};

use crate::domain::{Plan, PlanOutput, PlanStatus};
use crate::error::{OrchError, Result};

pub fn create_plan(conn: &Connection, plan: &Plan) -> Result<()> {
    conn.execute(
        "INSERT INTO plans (id, project_id, version, status, output_json, rigor_level, cost_usd, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            plan.id,
            plan.project_id,
            plan.version,
            plan.status.as_str(),
            serde_json::to_string(&plan.output)?,
            plan.rigor_level,
            plan.cost_usd,
            plan.created_at.to_rfc3339(),
            plan.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Creating a new draft plan supersedes any existing draft for the project.
pub fn supersede_drafts(conn: &Connection, project_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE plans SET status = 'superseded', updated_at = ?1 WHERE project_id = ?2 AND status = 'draft'",
        params![chrono::Utc::now().to_rfc3339(), project_id],
    )?;
    Ok(())
}

pub fn get_plan(conn: &Connection, id: &str) -> Result<Plan> {
    conn.query_row(
        "SELECT id, project_id, version, status, output_json, rigor_level, cost_usd, created_at, updated_at
         FROM plans WHERE id = ?1",
        params![id],
        row_to_plan,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => OrchError::not_found("plan", id),
        other => OrchError::from(other),
    })
}

pub fn latest_plan(conn: &Connection, project_id: &str) -> Result<Plan> {
    conn.query_row(
        "SELECT id, project_id, version, status, output_json, rigor_level, cost_usd, created_at, updated_at
         FROM plans WHERE project_id = ?1 ORDER BY version DESC LIMIT 1",
        params![project_id],
        row_to_plan,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => OrchError::not_found("plan", project_id),
        other => OrchError::from(other),
    })
}

pub fn set_plan_status(conn: &Connection, id: &str, status: PlanStatus) -> Result<()> {
    let n = conn.execute(
        "UPDATE plans SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status.as_str(), chrono::Utc::now().to_rfc3339(), id],
    )?;
    if n == 0 {
        return Err(OrchError::not_found("plan", id));
    }
    Ok(())
}

fn row_to_plan(row: &rusqlite::Row) -> rusqlite::Result<Plan> {
    let output_json: String = row.get(4)?;
    let output: PlanOutput = serde_json::from_str(&output_json).unwrap_or_default();
    Ok(Plan {
        id: row.get(0)?,
        project_id: row.get(1)?,
        version: row.get::<_, i64>(2)? as u32,
        status: PlanStatus::from_str(&row.get::<_, String>(3)?).unwrap_or(PlanStatus::Draft),
        output,
        rigor_level: row.get::<_, i64>(5)? as u8,
        cost_usd: row.get(6)?,
        created_at: super::parse_ts(&row.get::<_, String>(7)?),
        updated_at: super::parse_ts(&row.get::<_, String>(8)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Project;
    use crate::store::{project_repo, Store};

    fn seed_project(store: &Store) -> Project {
        let project = Project::new("Widget app", "build a widget");
        store.with_conn(|conn| project_repo::create_project(conn, &project)).unwrap();
        project
    }

    #[test]
    fn create_and_supersede() {
        let store = Store::init_in_memory().unwrap();
        let project = seed_project(&store);

        let plan_v1 = Plan::new(project.id.clone(), 1, PlanOutput::default(), 1);
        store.with_conn(|conn| create_plan(conn, &plan_v1)).unwrap();

        store.with_conn(|conn| supersede_drafts(conn, &project.id)).unwrap();
        let plan_v2 = Plan::new(project.id.clone(), 2, PlanOutput::default(), 1);
        store.with_conn(|conn| create_plan(conn, &plan_v2)).unwrap();

        let fetched_v1 = store.with_conn(|conn| get_plan(conn, &plan_v1.id)).unwrap();
        assert_eq!(fetched_v1.status, PlanStatus::Superseded);

        let latest = store.with_conn(|conn| latest_plan(conn, &project.id)).unwrap();
        assert_eq!(latest.id, plan_v2.id);
    }
}
