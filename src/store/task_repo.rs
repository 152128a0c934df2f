use rusqlite::{params, Connection};

use crate::domain::{ContextEntry, ModelTier, Task, TaskStatus};
use crate::error::{OrchError, Result};

const SELECT_COLUMNS: &str = "id, project_id, plan_id, title, description, task_type, model_tier, priority, wave,
     phase, tools_json, context_json, status, output_text, artifacts_json, prompt_tokens, completion_tokens,
     cost_usd, retry_count, model_used, verification_criteria, affected_files_json, error,
     created_at, updated_at, started_at, completed_at";

pub fn create_task(conn: &Connection, task: &Task) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO tasks ({SELECT_COLUMNS})
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24,?25,?26,?27)"
        ),
        params![
            task.id,
            task.project_id,
            task.plan_id,
            task.title,
            task.description,
            task.task_type,
            task.model_tier.as_str(),
            task.priority,
            task.wave,
            task.phase,
            serde_json::to_string(&task.tools)?,
            serde_json::to_string(&task.context)?,
            task.status.as_str(),
            task.output_text,
            serde_json::to_string(&task.artifacts)?,
            task.prompt_tokens,
            task.completion_tokens,
            task.cost_usd,
            task.retry_count,
            task.model_used,
            task.verification_criteria,
            serde_json::to_string(&task.affected_files)?,
            task.error,
            task.created_at.to_rfc3339(),
            task.updated_at.to_rfc3339(),
            task.started_at.map(|t| t.to_rfc3339()),
            task.completed_at.map(|t| t.to_rfc3339()),
        ],
    )?;
    Ok(())
}

pub fn add_dependency(conn: &Connection, task_id: &str, depends_on: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO task_deps (task_id, depends_on) VALUES (?1, ?2)",
        params![task_id, depends_on],
    )?;
    Ok(())
}

pub fn dependencies_of(conn: &Connection, task_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT depends_on FROM task_deps WHERE task_id = ?1")?;
    let ids = stmt
        .query_map(params![task_id], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}

/// Tasks that depend directly on `task_id`, i.e. its successors in the DAG.
pub fn dependents_of(conn: &Connection, task_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT task_id FROM task_deps WHERE depends_on = ?1")?;
    let ids = stmt
        .query_map(params![task_id], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}

/// `pending` tasks with at least one non-completed predecessor move to
/// `blocked`. Run once right after decomposition writes tasks + edges.
pub fn mark_blocked(conn: &Connection, project_id: &str) -> Result<usize> {
    let n = conn.execute(
        "UPDATE tasks SET status = 'blocked', updated_at = ?2
         WHERE project_id = ?1 AND status = 'pending'
           AND EXISTS (
               SELECT 1 FROM task_deps d JOIN tasks dep ON dep.id = d.depends_on
               WHERE d.task_id = tasks.id AND dep.status != 'completed'
           )",
        params![project_id, chrono::Utc::now().to_rfc3339()],
    )?;
    Ok(n)
}

/// `blocked` tasks whose every predecessor is now `completed` move back to
/// `pending`. Run at the start of every Executor tick.
pub fn unblock_ready(conn: &Connection, project_id: &str) -> Result<usize> {
    let n = conn.execute(
        "UPDATE tasks SET status = 'pending', updated_at = ?2
         WHERE project_id = ?1 AND status = 'blocked'
           AND NOT EXISTS (
               SELECT 1 FROM task_deps d JOIN tasks dep ON dep.id = d.depends_on
               WHERE d.task_id = tasks.id AND dep.status != 'completed'
           )",
        params![project_id, chrono::Utc::now().to_rfc3339()],
    )?;
    Ok(n)
}

/// Whether the project has no task in a dispatchable or in-flight state
/// (`pending`/`queued`/`running`) while some remain `blocked` — i.e. it can
/// never progress further on its own.
pub fn has_dead_blocked_tasks(conn: &Connection, project_id: &str) -> Result<bool> {
    let dispatchable: i64 = conn.query_row(
        "SELECT COUNT(*) FROM tasks WHERE project_id = ?1 AND status IN ('pending','queued','running')",
        params![project_id],
        |row| row.get(0),
    )?;
    if dispatchable > 0 {
        return Ok(false);
    }
    let blocked: i64 =
        conn.query_row("SELECT COUNT(*) FROM tasks WHERE project_id = ?1 AND status = 'blocked'", params![project_id], |row| {
            row.get(0)
        })?;
    Ok(blocked > 0)
}

/// Whether any task in the project reached `failed`.
pub fn has_failed_tasks(conn: &Connection, project_id: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM tasks WHERE project_id = ?1 AND status = 'failed'",
        params![project_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn get_task(conn: &Connection, id: &str) -> Result<Task> {
    conn.query_row(
        &format!("SELECT {SELECT_COLUMNS} FROM tasks WHERE id = ?1"),
        params![id],
        row_to_task,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => OrchError::not_found("task", id),
        other => OrchError::from(other),
    })
}

pub fn list_tasks_by_plan(conn: &Connection, plan_id: &str) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(&format!("SELECT {SELECT_COLUMNS} FROM tasks WHERE plan_id = ?1 ORDER BY wave, priority"))?;
    let tasks = stmt.query_map(params![plan_id], row_to_task)?.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tasks)
}

/// Tasks in `project_id` at `wave` with status `pending` and no non-completed
/// predecessor, ordered by priority ascending (lower priority value first).
pub fn ready_tasks(conn: &Connection, project_id: &str, wave: i32) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS} FROM tasks t
         WHERE t.project_id = ?1 AND t.wave = ?2 AND t.status = 'pending'
           AND NOT EXISTS (
               SELECT 1 FROM task_deps d
               JOIN tasks dep ON dep.id = d.depends_on
               WHERE d.task_id = t.id AND dep.status != 'completed'
           )
         ORDER BY t.priority ASC"
    ))?;
    let tasks = stmt
        .query_map(params![project_id, wave], row_to_task)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tasks)
}

/// `min(wave)` over non-terminal tasks in the project, i.e. the current wave.
pub fn current_wave(conn: &Connection, project_id: &str) -> Result<Option<i32>> {
    let wave: Option<i32> = conn.query_row(
        "SELECT MIN(wave) FROM tasks
         WHERE project_id = ?1 AND status NOT IN ('completed','needs_review','failed','cancelled')",
        params![project_id],
        |row| row.get(0),
    )?;
    Ok(wave)
}

pub fn max_wave(conn: &Connection, project_id: &str) -> Result<i32> {
    let wave: Option<i32> = conn.query_row(
        "SELECT MAX(wave) FROM tasks WHERE project_id = ?1",
        params![project_id],
        |row| row.get(0),
    )?;
    Ok(wave.unwrap_or(0))
}

pub fn all_terminal(conn: &Connection, project_id: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM tasks
         WHERE project_id = ?1 AND status NOT IN ('completed','needs_review','failed','cancelled')",
        params![project_id],
        |row| row.get(0),
    )?;
    Ok(count == 0)
}

/// Count of non-terminal tasks remaining at a given wave. The Executor uses
/// this to decide whether a wave has fully drained before advancing (or
/// pausing, when wave-checkpoints are enabled).
pub fn non_terminal_count_at_wave(conn: &Connection, project_id: &str, wave: i32) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM tasks
         WHERE project_id = ?1 AND wave = ?2
           AND status NOT IN ('completed','needs_review','failed','cancelled')",
        params![project_id, wave],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Reset a task interrupted mid-dispatch by `Executor::stop` back to
/// `pending`, stamping the shutdown reason as its error. Unlike
/// [`reset_for_retry`], retry_count and prior output are left untouched -
/// this is a forced pause, not a fresh attempt.
pub fn interrupt_for_shutdown(conn: &Connection, id: &str) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET status = 'pending', error = 'interrupted by shutdown', started_at = NULL, updated_at = ?1
         WHERE id = ?2",
        params![chrono::Utc::now().to_rfc3339(), id],
    )?;
    Ok(())
}

pub fn set_status(conn: &Connection, id: &str, status: TaskStatus) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    let (started_clause, completed_clause) = match status {
        TaskStatus::Running => (", started_at = COALESCE(started_at, ?4)", ""),
        s if s.is_terminal() => ("", ", completed_at = ?4"),
        _ => ("", ""),
    };
    let sql = format!("UPDATE tasks SET status = ?1, updated_at = ?2{started_clause}{completed_clause} WHERE id = ?3");
    let n = conn.execute(&sql, params![status.as_str(), now, id, now])?;
    if n == 0 {
        return Err(OrchError::not_found("task", id));
    }
    Ok(())
}

/// Atomically claim a `pending` task into `queued`: the CAS that prevents
/// two overlapping Executor ticks from both dispatching the same task. The
/// Lifecycle later transitions `queued -> running` via [`start_running`] once
/// it actually begins the dispatch.
pub fn claim_pending_to_queued(conn: &Connection, id: &str) -> Result<bool> {
    let now = chrono::Utc::now().to_rfc3339();
    let n = conn.execute(
        "UPDATE tasks SET status = 'queued', updated_at = ?2 WHERE id = ?1 AND status = 'pending'",
        params![id, now],
    )?;
    Ok(n == 1)
}

/// Transition a claimed task from `queued` to `running`, stamping `started_at`.
/// Called by the Lifecycle once it has acquired the task and is about to
/// invoke an Agent runner.
pub fn start_running(conn: &Connection, id: &str) -> Result<bool> {
    let now = chrono::Utc::now().to_rfc3339();
    let n = conn.execute(
        "UPDATE tasks SET status = 'running', started_at = COALESCE(started_at, ?2), updated_at = ?2
         WHERE id = ?1 AND status = 'queued'",
        params![id, now],
    )?;
    Ok(n == 1)
}

pub fn record_output(
    conn: &Connection,
    id: &str,
    output_text: Option<&str>,
    artifacts: &[String],
    prompt_tokens: i64,
    completion_tokens: i64,
    cost_usd: f64,
    model_used: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET output_text = ?1, artifacts_json = ?2, prompt_tokens = prompt_tokens + ?3,
         completion_tokens = completion_tokens + ?4, cost_usd = cost_usd + ?5, model_used = ?6, error = NULL, updated_at = ?7
         WHERE id = ?8",
        params![
            output_text,
            serde_json::to_string(artifacts)?,
            prompt_tokens,
            completion_tokens,
            cost_usd,
            model_used,
            chrono::Utc::now().to_rfc3339(),
            id,
        ],
    )?;
    Ok(())
}

pub fn push_context(conn: &Connection, id: &str, entry: &ContextEntry) -> Result<()> {
    let mut task = get_task(conn, id)?;
    task.push_context(entry.clone());
    conn.execute(
        "UPDATE tasks SET context_json = ?1, updated_at = ?2 WHERE id = ?3",
        params![serde_json::to_string(&task.context)?, task.updated_at.to_rfc3339(), id],
    )?;
    Ok(())
}

pub fn set_error(conn: &Connection, id: &str, error: &str) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET error = ?1, updated_at = ?2 WHERE id = ?3",
        params![error, chrono::Utc::now().to_rfc3339(), id],
    )?;
    Ok(())
}

pub fn increment_retry(conn: &Connection, id: &str) -> Result<u32> {
    conn.execute(
        "UPDATE tasks SET retry_count = retry_count + 1, updated_at = ?1 WHERE id = ?2",
        params![chrono::Utc::now().to_rfc3339(), id],
    )?;
    let retry_count: i64 = conn.query_row("SELECT retry_count FROM tasks WHERE id = ?1", params![id], |r| r.get(0))?;
    Ok(retry_count as u32)
}

pub fn reset_for_retry(conn: &Connection, id: &str) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET status = 'pending', output_text = NULL, error = NULL, retry_count = 0,
         started_at = NULL, completed_at = NULL, updated_at = ?1 WHERE id = ?2",
        params![chrono::Utc::now().to_rfc3339(), id],
    )?;
    Ok(())
}

/// Startup recovery: `running`/`queued` tasks whose `updated_at` predates the
/// threshold are stale (the process died mid-dispatch). Reset to `pending`;
/// `running` tasks lose an attempt (increment retry_count), `queued` tasks
/// had no attempt and don't.
pub fn recover_stale_tasks(conn: &Connection, stale_threshold_secs: u64) -> Result<Vec<String>> {
    let cutoff = (chrono::Utc::now() - chrono::Duration::seconds(stale_threshold_secs as i64)).to_rfc3339();
    let mut stmt = conn.prepare(
        "SELECT id, status FROM tasks WHERE status IN ('running','queued') AND updated_at < ?1",
    )?;
    let stale: Vec<(String, String)> = stmt
        .query_map(params![cutoff], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut recovered = Vec::new();
    for (id, status) in stale {
        conn.execute(
            "UPDATE tasks SET status = 'pending', started_at = NULL, updated_at = ?1 WHERE id = ?2",
            params![chrono::Utc::now().to_rfc3339(), id],
        )?;
        if status == "running" {
            conn.execute(
                "UPDATE tasks SET retry_count = retry_count + 1 WHERE id = ?1",
                params![id],
            )?;
        }
        recovered.push(id);
    }
    Ok(recovered)
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
    let tools_json: String = row.get(10)?;
    let context_json: String = row.get(11)?;
    let artifacts_json: String = row.get(14)?;
    let affected_files_json: String = row.get(21)?;

    Ok(Task {
        id: row.get(0)?,
        project_id: row.get(1)?,
        plan_id: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        task_type: row.get(5)?,
        model_tier: ModelTier::from_str(&row.get::<_, String>(6)?).unwrap_or(ModelTier::Haiku),
        priority: row.get(7)?,
        wave: row.get(8)?,
        phase: row.get(9)?,
        tools: serde_json::from_str(&tools_json).unwrap_or_default(),
        context: serde_json::from_str(&context_json).unwrap_or_default(),
        status: TaskStatus::from_str(&row.get::<_, String>(12)?).unwrap_or(TaskStatus::Pending),
        output_text: row.get(13)?,
        artifacts: serde_json::from_str(&artifacts_json).unwrap_or_default(),
        prompt_tokens: row.get(15)?,
        completion_tokens: row.get(16)?,
        cost_usd: row.get(17)?,
        retry_count: row.get::<_, i64>(18)? as u32,
        model_used: row.get(19)?,
        verification_criteria: row.get(20)?,
        affected_files: serde_json::from_str(&affected_files_json).unwrap_or_default(),
        error: row.get(22)?,
        created_at: super::parse_ts(&row.get::<_, String>(23)?),
        updated_at: super::parse_ts(&row.get::<_, String>(24)?),
        started_at: row.get::<_, Option<String>>(25)?.map(|s| super::parse_ts(&s)),
        completed_at: row.get::<_, Option<String>>(26)?.map(|s| super::parse_ts(&s)),
    })
}
