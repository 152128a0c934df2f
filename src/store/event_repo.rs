use rusqlite::{params, Connection};

use crate::domain::TaskEvent;
use crate::error::Result;

pub fn create_event(conn: &Connection, event: &TaskEvent) -> Result<i64> {
    conn.execute(
        "INSERT INTO task_events (project_id, task_id, event_type, message, data_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event.project_id,
            event.task_id,
            event.event_type,
            event.message,
            serde_json::to_string(&event.data)?,
            event.created_at.to_rfc3339(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn list_for_project(conn: &Connection, project_id: &str, since_id: i64) -> Result<Vec<TaskEvent>> {
    let mut stmt = conn.prepare(
        "SELECT id, project_id, task_id, event_type, message, data_json, created_at
         FROM task_events WHERE project_id = ?1 AND id > ?2 ORDER BY id ASC",
    )?;
    let events = stmt
        .query_map(params![project_id, since_id], row_to_event)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(events)
}

pub fn list_for_task(conn: &Connection, task_id: &str) -> Result<Vec<TaskEvent>> {
    let mut stmt = conn.prepare(
        "SELECT id, project_id, task_id, event_type, message, data_json, created_at
         FROM task_events WHERE task_id = ?1 ORDER BY id ASC",
    )?;
    let events = stmt.query_map(params![task_id], row_to_event)?.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(events)
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<TaskEvent> {
    let data_json: String = row.get(5)?;
    Ok(TaskEvent {
        id: row.get(0)?,
        project_id: row.get(1)?,
        task_id: row.get(2)?,
        event_type: row.get(3)?,
        message: row.get(4)?,
        data: serde_json::from_str(&data_json).unwrap_or(serde_json::json!({})),
        created_at: super::parse_ts(&row.get::<_, String>(6)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Project;
    use crate::store::{project_repo, Store};

    #[test]
    fn create_and_list_events_by_project() {
        let store = Store::init_in_memory().unwrap();
        let project = Project::new("Widget app", "build a widget");
        store.with_conn(|conn| project_repo::create_project(conn, &project)).unwrap();

        let e1 = TaskEvent::new(project.id.clone(), None, "project_created", "created", serde_json::json!({}));
        store.with_conn(|conn| create_event(conn, &e1)).unwrap();
        let e2 = TaskEvent::new(project.id.clone(), None, "plan_created", "planned", serde_json::json!({}));
        store.with_conn(|conn| create_event(conn, &e2)).unwrap();

        let events = store.with_conn(|conn| list_for_project(conn, &project.id, 0)).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "project_created");
    }
}
