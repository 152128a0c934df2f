//! Transactional persistence for projects, plans, tasks, dependencies, usage,
//! budget periods, checkpoints, and events. One SQLite file, WAL mode.

pub mod checkpoint_repo;
pub mod event_repo;
pub mod migrations;
pub mod plan_repo;
pub mod project_repo;
pub mod task_repo;
pub mod usage_repo;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;

use crate::error::Result;

/// Owns the single SQLite connection. Callers reach the connection through
/// `with_conn`/`with_tx`; repository functions are free functions taking
/// `&Connection` or `&Transaction`, matching the worktoolai-taskai layout.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if necessary) the database at `path`, configure pragmas,
    /// and optionally run migrations.
    pub fn init<P: AsRef<Path>>(path: P, run_migrations: bool) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| crate::error::OrchError::database(e.to_string()))?;
            }
        }

        let conn = Connection::open(path)?;
        configure_connection(&conn)?;
        if run_migrations {
            migrations::run_migrations(&conn)?;
        }
        run_crash_recovery(&conn)?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open an in-memory database, for tests.
    pub fn init_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        configure_connection(&conn)?;
        migrations::run_migrations(&conn)?;
        run_crash_recovery(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Run `f` with exclusive access to the connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().expect("store connection mutex poisoned");
        f(&conn)
    }

    /// Run `f` inside a transaction, committing on `Ok`, rolling back on `Err`.
    pub fn with_tx<T>(&self, f: impl FnOnce(&rusqlite::Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().expect("store connection mutex poisoned");
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    pub fn close(self) {
        drop(self.conn);
    }
}

/// Parse an RFC3339 timestamp column, falling back to "now" on corrupt data
/// rather than panicking a repository read.
pub(crate) fn parse_ts(s: &str) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(|_| chrono::Utc::now())
}

/// Blunt startup recovery: no process-lifetime state (an in-flight dispatch,
/// an executing project with live in-memory tracking) survives a restart.
/// Every `running`/`queued` task is failed outright and every `executing`
/// project is paused, regardless of age — the Executor's own
/// `task_repo::recover_stale_tasks` is the age-gated, retry-preserving
/// recovery that runs *within* a live process.
fn run_crash_recovery(conn: &Connection) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    let n = conn.execute(
        "UPDATE tasks SET status = 'failed', error = 'interrupted: process restarted before completion', updated_at = ?1
         WHERE status IN ('running', 'queued')",
        rusqlite::params![now],
    )?;
    if n > 0 {
        tracing::warn!(count = n, "startup recovery: failed running/queued tasks from a prior process");
    }

    let n = conn.execute(
        "UPDATE projects SET status = 'paused', updated_at = ?1 WHERE status = 'executing'",
        rusqlite::params![now],
    )?;
    if n > 0 {
        tracing::warn!(count = n, "startup recovery: paused executing projects from a prior process");
    }

    Ok(())
}

fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA busy_timeout=5000;
         PRAGMA foreign_keys=ON;",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_in_memory_runs_migrations() {
        let store = Store::init_in_memory().unwrap();
        let count: i64 = store
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'", [], |r| r.get(0))?)
            })
            .unwrap();
        assert!(count >= 9);
    }

    #[test]
    fn with_tx_rolls_back_on_error() {
        let store = Store::init_in_memory().unwrap();
        let result: Result<()> = store.with_tx(|tx| {
            tx.execute("INSERT INTO users (id) VALUES ('u1')", [])?;
            Err(crate::error::OrchError::conflict("boom"))
        });
        assert!(result.is_err());
        let count: i64 = store
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn init_recovers_running_tasks_and_executing_projects() {
        use crate::domain::{ModelTier, Plan, PlanOutput, Project, ProjectStatus, Task};

        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("forge.db");

        {
            let store = Store::init(&db_path, true).unwrap();
            let mut project = Project::new("Widget app", "build a widget");
            project.status = ProjectStatus::Executing;
            store
                .with_conn(|conn| {
                    crate::store::project_repo::create_project(conn, &project)?;
                    conn.execute(
                        "UPDATE projects SET status = 'executing' WHERE id = ?1",
                        rusqlite::params![project.id],
                    )?;
                    Ok(())
                })
                .unwrap();
            let plan = Plan::new(project.id.clone(), 1, PlanOutput::default(), 1);
            store.with_conn(|conn| crate::store::plan_repo::create_plan(conn, &plan)).unwrap();
            let task = Task::new(&project.id, &plan.id, "A", "d", "code", ModelTier::Haiku, 1);
            store
                .with_conn(|conn| {
                    crate::store::task_repo::create_task(conn, &task)?;
                    conn.execute("UPDATE tasks SET status = 'running' WHERE id = ?1", rusqlite::params![task.id])?;
                    Ok(())
                })
                .unwrap();
            store.close();
        }

        let store = Store::init(&db_path, true).unwrap();
        let project_status: String =
            store.with_conn(|conn| Ok(conn.query_row("SELECT status FROM projects", [], |r| r.get(0))?)).unwrap();
        assert_eq!(project_status, "paused");
        let task_status: String =
            store.with_conn(|conn| Ok(conn.query_row("SELECT status FROM tasks", [], |r| r.get(0))?)).unwrap();
        assert_eq!(task_status, "failed");
    }
}
