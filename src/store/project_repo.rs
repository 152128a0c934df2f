use rusqlite::{params, Connection};

use crate::domain::{Project, ProjectStatus};
use crate::error::{OrchError, Result};

pub fn create_project(conn: &Connection, project: &Project) -> Result<()> {
    conn.execute(
        "INSERT INTO projects (id, owner_id, title, requirements, status, config_json, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            project.id,
            project.owner_id,
            project.title,
            project.requirements,
            project.status.as_str(),
            serde_json::to_string(&project.config)?,
            project.created_at.to_rfc3339(),
            project.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn get_project(conn: &Connection, id: &str) -> Result<Project> {
    conn.query_row(
        "SELECT id, owner_id, title, requirements, status, config_json, created_at, updated_at
         FROM projects WHERE id = ?1",
        params![id],
        row_to_project,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => OrchError::not_found("project", id),
        other => OrchError::from(other),
    })
}

pub fn list_projects(conn: &Connection, status: Option<ProjectStatus>) -> Result<Vec<Project>> {
    let mut stmt;
    let rows = if let Some(status) = status {
        stmt = conn.prepare(
            "SELECT id, owner_id, title, requirements, status, config_json, created_at, updated_at
             FROM projects WHERE status = ?1 ORDER BY created_at DESC",
        )?;
        stmt.query_map(params![status.as_str()], row_to_project)?
            .collect::<rusqlite::Result<Vec<_>>>()?
    } else {
        stmt = conn.prepare(
            "SELECT id, owner_id, title, requirements, status, config_json, created_at, updated_at
             FROM projects ORDER BY created_at DESC",
        )?;
        stmt.query_map(params![], row_to_project)?
            .collect::<rusqlite::Result<Vec<_>>>()?
    };
    Ok(rows)
}

pub fn update_project_status(conn: &Connection, id: &str, status: ProjectStatus) -> Result<()> {
    let n = conn.execute(
        "UPDATE projects SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status.as_str(), chrono::Utc::now().to_rfc3339(), id],
    )?;
    if n == 0 {
        return Err(OrchError::not_found("project", id));
    }
    Ok(())
}

/// Projects with no remaining non-terminal tasks in their current wave, i.e.
/// candidates for advancing. Callers filter further by wave comparison.
pub fn executing_projects(conn: &Connection) -> Result<Vec<Project>> {
    list_projects(conn, Some(ProjectStatus::Executing))
}

fn row_to_project(row: &rusqlite::Row) -> rusqlite::Result<Project> {
    let config_json: String = row.get(5)?;
    Ok(Project {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        title: row.get(2)?,
        requirements: row.get(3)?,
        status: ProjectStatus::from_str(&row.get::<_, String>(4)?).unwrap_or(ProjectStatus::Draft),
        config: serde_json::from_str(&config_json).unwrap_or(serde_json::json!({})),
        created_at: super::parse_ts(&row.get::<_, String>(6)?),
        updated_at: super::parse_ts(&row.get::<_, String>(7)?),
    })
}
