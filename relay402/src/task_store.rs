//! Bounded in-memory store for agent tasks.
//!
//! Embedders that expose an agent-to-agent surface next to the proxy can keep
//! task state here. The store is an explicit value, cloned cheaply and shared
//! across request tasks; when full, the oldest inserted task is evicted.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Default number of tasks kept before eviction starts.
pub const DEFAULT_TASK_CAPACITY: usize = 1000;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    /// Received, not yet started.
    Submitted,
    /// In progress.
    Working,
    /// Waiting on the requester.
    InputRequired,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Aborted.
    Canceled,
}

/// Current status of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    /// Lifecycle state.
    pub state: TaskState,
    /// When the state was last set.
    pub timestamp: DateTime<Utc>,
    /// Optional message attached to the transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
}

/// A stored task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Random UUID.
    pub id: String,
    /// Current status.
    pub status: TaskStatus,
    /// Conversation history.
    pub messages: Vec<Value>,
    /// Produced artifacts.
    pub artifacts: Vec<Value>,
    /// Free-form metadata.
    pub metadata: Map<String, Value>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<String, Task>,
    order: VecDeque<String>,
}

/// Thread-safe, bounded task store with oldest-first eviction.
#[derive(Clone)]
pub struct TaskStore {
    inner: Arc<Mutex<Inner>>,
    capacity: usize,
}

impl fmt::Debug for TaskStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskStore")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new(DEFAULT_TASK_CAPACITY)
    }
}

impl TaskStore {
    /// Creates an empty store holding at most `capacity` tasks (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates a `submitted` task, optionally seeded with a first message.
    pub fn create(&self, message: Option<Value>) -> Task {
        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4().to_string(),
            status: TaskStatus {
                state: TaskState::Submitted,
                timestamp: now,
                message: None,
            },
            messages: message.into_iter().collect(),
            artifacts: Vec::new(),
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
        };

        let mut inner = self.lock();
        while inner.tasks.len() >= self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.tasks.remove(&oldest);
            tracing::debug!(task_id = %oldest, "Evicted oldest task");
        }
        inner.order.push_back(task.id.clone());
        inner.tasks.insert(task.id.clone(), task.clone());
        task
    }

    /// Returns a snapshot of the task.
    pub fn get(&self, id: &str) -> Option<Task> {
        self.lock().tasks.get(id).cloned()
    }

    /// Sets a new status. Returns `false` if the task is unknown.
    pub fn update_status(&self, id: &str, state: TaskState, message: Option<Value>) -> bool {
        self.modify(id, |task, now| {
            task.status = TaskStatus {
                state,
                timestamp: now,
                message,
            };
        })
    }

    /// Appends to the task history. Returns `false` if the task is unknown.
    pub fn add_message(&self, id: &str, message: Value) -> bool {
        self.modify(id, |task, _| task.messages.push(message))
    }

    /// Appends an artifact. Returns `false` if the task is unknown.
    pub fn add_artifact(&self, id: &str, artifact: Value) -> bool {
        self.modify(id, |task, _| task.artifacts.push(artifact))
    }

    /// Number of stored tasks.
    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    /// `true` if no tasks are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn modify(&self, id: &str, f: impl FnOnce(&mut Task, DateTime<Utc>)) -> bool {
        let mut inner = self.lock();
        let Some(task) = inner.tasks.get_mut(id) else {
            return false;
        };
        let now = Utc::now();
        f(task, now);
        task.updated_at = now;
        true
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn create_and_get() {
        let store = TaskStore::default();
        let task = store.create(Some(json!({ "role": "user" })));
        assert_eq!(task.status.state, TaskState::Submitted);
        assert_eq!(task.messages.len(), 1);
        assert_eq!(store.get(&task.id), Some(task));
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn updates_touch_timestamp() {
        let store = TaskStore::default();
        let task = store.create(None);
        assert!(store.update_status(&task.id, TaskState::Working, Some(json!("started"))));
        assert!(store.add_message(&task.id, json!({ "role": "agent" })));
        assert!(store.add_artifact(&task.id, json!({ "name": "report" })));

        let stored = store.get(&task.id).unwrap();
        assert_eq!(stored.status.state, TaskState::Working);
        assert_eq!(stored.status.message, Some(json!("started")));
        assert_eq!(stored.messages.len(), 1);
        assert_eq!(stored.artifacts.len(), 1);
        assert!(stored.updated_at >= stored.created_at);
    }

    #[test]
    fn unknown_task_is_not_modified() {
        let store = TaskStore::default();
        assert!(!store.update_status("nope", TaskState::Failed, None));
        assert!(!store.add_message("nope", json!({})));
        assert!(!store.add_artifact("nope", json!({})));
    }

    #[test]
    fn evicts_oldest_first() {
        let store = TaskStore::new(2);
        let first = store.create(None);
        let second = store.create(None);
        let third = store.create(None);

        assert_eq!(store.len(), 2);
        assert!(store.get(&first.id).is_none());
        assert!(store.get(&second.id).is_some());
        assert!(store.get(&third.id).is_some());
    }

    #[test]
    fn clones_share_state() {
        let store = TaskStore::default();
        let other = store.clone();
        let task = store.create(None);
        assert!(other.update_status(&task.id, TaskState::Completed, None));
        assert_eq!(store.get(&task.id).unwrap().status.state, TaskState::Completed);
        assert!(!store.is_empty());
    }

    #[test]
    fn state_wire_names() {
        assert_eq!(serde_json::to_value(TaskState::InputRequired).unwrap(), "input-required");
    }
}
