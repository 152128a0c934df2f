//! Progress bus: persists every task/project event and fans live copies out
//! to SSE subscribers.
//!
//! Publishing never blocks on a slow subscriber — each subscriber holds a
//! bounded channel, and a full channel means the frame is dropped for that
//! subscriber only. The persisted event stream (`get`) is always complete;
//! only the live stream (`subscribe`) can skip frames under load.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::domain::TaskEvent;
use crate::error::Result;
use crate::store::{event_repo, Store};

const SUBSCRIBER_BUFFER: usize = 256;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

const TERMINAL_EVENT_TYPES: &[&str] = &["project_complete", "project_failed"];

pub struct ProgressBus {
    store: Arc<Store>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<String>>>>,
}

impl ProgressBus {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store, subscribers: Mutex::new(HashMap::new()) }
    }

    /// Persist an event and fan it out to any live subscribers for its
    /// project. Returns the event as written (with its assigned id).
    pub fn push(
        &self,
        project_id: &str,
        event_type: &str,
        message: &str,
        task_id: Option<&str>,
        data: serde_json::Value,
    ) -> Result<TaskEvent> {
        let mut event = TaskEvent::new(project_id, task_id.map(String::from), event_type, message, data);
        let id = self.store.with_conn(|conn| event_repo::create_event(conn, &event))?;
        event.id = id;

        self.broadcast(project_id, &event);
        Ok(event)
    }

    fn broadcast(&self, project_id: &str, event: &TaskEvent) {
        let frame = format_frame(event);
        let mut subs = self.subscribers.lock().expect("progress subscriber mutex poisoned");
        if let Some(senders) = subs.get_mut(project_id) {
            for tx in senders.iter() {
                let _ = tx.try_send(frame.clone());
            }
            senders.retain(|tx| !tx.is_closed());
            if senders.is_empty() {
                subs.remove(project_id);
            }
        }
    }

    /// Register a new live subscriber for `project_id` and return a stream
    /// handle. Dropping the handle (or letting the receiver close) prunes
    /// the registration lazily on the next publish.
    pub fn subscribe(&self, project_id: &str) -> ProgressStream {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.lock().expect("progress subscriber mutex poisoned").entry(project_id.to_string()).or_default().push(tx);
        ProgressStream { rx, done: false }
    }

    /// Chronological read from storage, optionally scoped to one task and
    /// capped to the most recent `limit` rows (0 = unlimited).
    pub fn get(&self, project_id: &str, task_id: Option<&str>, limit: usize) -> Result<Vec<TaskEvent>> {
        let mut events = self.store.with_conn(|conn| match task_id {
            Some(tid) => event_repo::list_for_task(conn, tid),
            None => event_repo::list_for_project(conn, project_id, 0),
        })?;
        if task_id.is_some() {
            events.retain(|e| e.project_id == project_id);
        }
        if limit > 0 && events.len() > limit {
            let drop = events.len() - limit;
            events.drain(..drop);
        }
        Ok(events)
    }
}

/// A live per-subscriber handle over [`ProgressBus::subscribe`]. `next`
/// yields one SSE frame per event, plus a keep-alive comment frame after
/// `KEEPALIVE_INTERVAL` of silence, and ends after a terminal event or once
/// the bus drops this subscriber's sender.
pub struct ProgressStream {
    rx: mpsc::Receiver<String>,
    done: bool,
}

impl ProgressStream {
    pub async fn next(&mut self) -> Option<String> {
        if self.done {
            return None;
        }
        match timeout(KEEPALIVE_INTERVAL, self.rx.recv()).await {
            Ok(Some(frame)) => {
                if is_terminal_frame(&frame) {
                    self.done = true;
                }
                Some(frame)
            }
            Ok(None) => None,
            Err(_elapsed) => Some(": keepalive\n\n".to_string()),
        }
    }
}

fn format_frame(event: &TaskEvent) -> String {
    let payload = serde_json::json!({
        "id": event.id,
        "project_id": event.project_id,
        "task_id": event.task_id,
        "message": event.message,
        "data": event.data,
        "created_at": event.created_at.to_rfc3339(),
    });
    format!("event: {}\ndata: {}\n\n", event.event_type, payload)
}

fn is_terminal_frame(frame: &str) -> bool {
    TERMINAL_EVENT_TYPES.iter().any(|t| frame.starts_with(&format!("event: {t}\n")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_persists_and_broadcasts_to_subscriber() {
        let store = Arc::new(Store::init_in_memory().unwrap());
        let project = crate::domain::Project::new("Widget app", "build a widget");
        store.with_conn(|conn| crate::store::project_repo::create_project(conn, &project)).unwrap();

        let bus = ProgressBus::new(store);
        let mut stream = bus.subscribe(&project.id);

        bus.push(&project.id, "project_created", "created", None, serde_json::json!({})).unwrap();

        let frame = stream.next().await.unwrap();
        assert!(frame.starts_with("event: project_created\n"));

        let persisted = bus.get(&project.id, None, 0).unwrap();
        assert_eq!(persisted.len(), 1);
    }

    #[tokio::test]
    async fn stream_ends_after_terminal_event() {
        let store = Arc::new(Store::init_in_memory().unwrap());
        let project = crate::domain::Project::new("Widget app", "build a widget");
        store.with_conn(|conn| crate::store::project_repo::create_project(conn, &project)).unwrap();

        let bus = ProgressBus::new(store);
        let mut stream = bus.subscribe(&project.id);

        bus.push(&project.id, "task_started", "go", None, serde_json::json!({})).unwrap();
        bus.push(&project.id, "project_complete", "done", None, serde_json::json!({})).unwrap();

        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn get_caps_to_most_recent_limit() {
        let store = Arc::new(Store::init_in_memory().unwrap());
        let project = crate::domain::Project::new("Widget app", "build a widget");
        store.with_conn(|conn| crate::store::project_repo::create_project(conn, &project)).unwrap();

        let bus = ProgressBus::new(store);
        for i in 0..5 {
            bus.push(&project.id, "tick", &format!("tick {i}"), None, serde_json::json!({})).unwrap();
        }

        let recent = bus.get(&project.id, None, 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "tick 3");
        assert_eq!(recent[1].message, "tick 4");
    }
}
