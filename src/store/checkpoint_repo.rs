use rusqlite::{params, Connection};

use crate::domain::{Attempt, Checkpoint, CheckpointType};
use crate::error::{OrchError, Result};

pub fn create_checkpoint(conn: &Connection, checkpoint: &Checkpoint) -> Result<()> {
    conn.execute(
        "INSERT INTO checkpoints (id, project_id, task_id, checkpoint_type, summary, attempts_json, question, response, created_at, resolved_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
        params![
            checkpoint.id,
            checkpoint.project_id,
            checkpoint.task_id,
            checkpoint.checkpoint_type.as_str(),
            checkpoint.summary,
            serde_json::to_string(&checkpoint.attempts)?,
            checkpoint.question,
            checkpoint.response,
            checkpoint.created_at.to_rfc3339(),
            checkpoint.resolved_at.map(|t| t.to_rfc3339()),
        ],
    )?;
    Ok(())
}

pub fn get_checkpoint(conn: &Connection, id: &str) -> Result<Checkpoint> {
    conn.query_row(
        "SELECT id, project_id, task_id, checkpoint_type, summary, attempts_json, question, response, created_at, resolved_at
         FROM checkpoints WHERE id = ?1",
        params![id],
        row_to_checkpoint,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => OrchError::not_found("checkpoint", id),
        other => OrchError::from(other),
    })
}

pub fn unresolved_for_task(conn: &Connection, task_id: &str) -> Result<Option<Checkpoint>> {
    let mut stmt = conn.prepare(
        "SELECT id, project_id, task_id, checkpoint_type, summary, attempts_json, question, response, created_at, resolved_at
         FROM checkpoints WHERE task_id = ?1 AND resolved_at IS NULL ORDER BY created_at DESC LIMIT 1",
    )?;
    let mut rows = stmt.query(params![task_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_checkpoint(row)?)),
        None => Ok(None),
    }
}

pub fn unresolved_for_project(conn: &Connection, project_id: &str) -> Result<Vec<Checkpoint>> {
    let mut stmt = conn.prepare(
        "SELECT id, project_id, task_id, checkpoint_type, summary, attempts_json, question, response, created_at, resolved_at
         FROM checkpoints WHERE project_id = ?1 AND resolved_at IS NULL ORDER BY created_at ASC",
    )?;
    let checkpoints = stmt.query_map(params![project_id], row_to_checkpoint)?.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(checkpoints)
}

pub fn resolve_checkpoint(conn: &Connection, id: &str, response: &str) -> Result<()> {
    let n = conn.execute(
        "UPDATE checkpoints SET response = ?1, resolved_at = ?2 WHERE id = ?3",
        params![response, chrono::Utc::now().to_rfc3339(), id],
    )?;
    if n == 0 {
        return Err(OrchError::not_found("checkpoint", id));
    }
    Ok(())
}

fn row_to_checkpoint(row: &rusqlite::Row) -> rusqlite::Result<Checkpoint> {
    let attempts_json: String = row.get(5)?;
    let attempts: Vec<Attempt> = serde_json::from_str(&attempts_json).unwrap_or_default();
    Ok(Checkpoint {
        id: row.get(0)?,
        project_id: row.get(1)?,
        task_id: row.get(2)?,
        checkpoint_type: CheckpointType::from_str(&row.get::<_, String>(3)?).unwrap_or(CheckpointType::RetryExhausted),
        summary: row.get(4)?,
        attempts,
        question: row.get(6)?,
        response: row.get(7)?,
        created_at: super::parse_ts(&row.get::<_, String>(8)?),
        resolved_at: row.get::<_, Option<String>>(9)?.map(|s| super::parse_ts(&s)),
    })
}
