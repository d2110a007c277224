#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::core::clock;
use crate::task::model::{Priority, TaskRecord, TaskStatus};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskUpdated,
    ExecutionEvent,
}

impl EventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TaskUpdated => "task_updated",
            Self::ExecutionEvent => "execution_event",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: String,
    pub event: EventKind,
    pub data: Value,
    pub timestamp: String,
}

/// Fire-and-forget fan-out. Publishing never blocks: with no subscribers the event is
/// dropped, and a subscriber that falls more than `capacity` events behind loses the
/// oldest ones.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<Event>,
}

impl EventPublisher {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn publish(&self, kind: EventKind, data: Value) {
        let event = Event {
            id: Uuid::new_v4().to_string(),
            event: kind,
            data,
            timestamp: clock::now_rfc3339(),
        };
        match self.sender.send(event) {
            Ok(n) => trace!(event = kind.as_str(), subscribers = n, "published event"),
            Err(_) => trace!(event = kind.as_str(), "no subscribers, event dropped"),
        }
    }

    pub fn publish_task_update(
        &self,
        task_id: &str,
        status: TaskStatus,
        priority: Option<Priority>,
        assignee: Option<&str>,
        artifacts: Option<&[String]>,
    ) {
        self.publish(
            EventKind::TaskUpdated,
            json!({
                "task_id": task_id,
                "status": status,
                "priority": priority,
                "assignee": assignee,
                "artifacts": artifacts,
            }),
        );
    }

    /// Announces a record entering or leaving the index (`created`, `indexed`, `deleted`).
    pub fn publish_task_event(&self, record: &TaskRecord, event: &str) {
        self.publish(
            EventKind::TaskUpdated,
            json!({
                "task_id": record.id,
                "event": event,
                "file_path": record.file_path,
                "status": record.status,
                "priority": record.priority,
                "assignee": record.assignee,
            }),
        );
    }

    /// `extra` keys are merged into the payload next to `task_id` and `execution_event`.
    pub fn publish_execution_event(&self, task_id: &str, execution_event: &str, extra: Value) {
        let mut data = Map::new();
        data.insert("task_id".to_owned(), Value::from(task_id));
        data.insert("execution_event".to_owned(), Value::from(execution_event));
        if let Value::Object(extra) = extra {
            for (k, v) in extra {
                data.entry(k).or_insert(v);
            }
        }
        self.publish(EventKind::ExecutionEvent, Value::Object(data));
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_is_silent() {
        let events = EventPublisher::new(4);
        assert_eq!(events.subscriber_count(), 0);
        events.publish(EventKind::TaskUpdated, json!({"task_id": "x"}));
    }

    #[tokio::test]
    async fn subscribers_receive_task_updates() {
        let events = EventPublisher::new(8);
        let mut rx = events.subscribe();
        let artifacts = vec!["a.txt".to_owned()];
        events.publish_task_update("t1", TaskStatus::Done, None, Some("kim"), Some(&artifacts));

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.event, EventKind::TaskUpdated);
        assert_eq!(ev.data["task_id"], "t1");
        assert_eq!(ev.data["status"], "done");
        assert_eq!(ev.data["assignee"], "kim");
        assert_eq!(ev.data["artifacts"], json!(["a.txt"]));
        assert!(ev.data["priority"].is_null());
        assert_eq!(serde_json::to_value(&ev).unwrap()["event"], "task_updated");
    }

    #[tokio::test]
    async fn slow_subscribers_lose_events_instead_of_blocking() {
        let events = EventPublisher::new(2);
        let mut rx = events.subscribe();
        for i in 0..5 {
            events.publish_execution_event("t1", "tick", json!({ "n": i }));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.data["n"], 3);
        assert_eq!(ev.data["execution_event"], "tick");
    }
}
