//! Task state machine and store (spec.md §3, §4.5).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

pub type TaskId = Uuid;

/// Task lifecycle state (spec.md §3 "Task").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Dispatching,
    Dispatched,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Whether `self -> next` is one of the edges spec.md §3 allows.
    fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Dispatching)
                | (Pending, Cancelled)
                | (Dispatching, Dispatched)
                | (Dispatching, Pending) // reservation lost, retry
                | (Dispatching, Failed) // submit rejected or retries exhausted, never reached Dispatched
                | (Dispatching, Cancelled)
                | (Dispatched, Completed)
                | (Dispatched, Failed)
                | (Dispatched, Pending) // backend lost, re-queue
                | (Dispatched, Cancelled)
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("task '{0}' not found")]
    NotFound(TaskId),

    #[error("cannot transition task '{task_id}' from {from:?} to {to:?}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskState,
        to: TaskState,
    },

    #[error("queue is full (max_size = {0})")]
    QueueFull(usize),
}

/// Opaque request payload. The dispatcher and task store never parse the
/// inner JSON — they forward it verbatim to whichever backend the
/// scheduler picks (spec.md §9 "opaque payload"). Cancel and history
/// lookups never go through the task store (the proxy facade resolves
/// those directly against the dispatcher/backend clients), so a task's
/// payload is always the prompt it was submitted with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub prompt: Value,
}

/// A unit of work moving through the balancer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub client_id: Option<String>,
    pub payload: Payload,
    pub state: TaskState,
    pub backend: Option<String>,
    pub upstream_prompt_id: Option<String>,
    pub retries: u32,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub error: Option<String>,
}

impl Task {
    fn new(task_id: TaskId, client_id: Option<String>, payload: Payload) -> Self {
        let now = now_ms();
        Self {
            task_id,
            client_id,
            payload,
            state: TaskState::Pending,
            backend: None,
            upstream_prompt_id: None,
            retries: 0,
            created_at_ms: now,
            updated_at_ms: now,
            error: None,
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Events published on every task state transition, consumed by the Event
/// Hub to drive `task_update` management-WebSocket frames (spec.md §4.7).
#[derive(Debug, Clone, Serialize)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub state: TaskState,
    pub backend: Option<String>,
}

/// `DashMap<TaskId, Task>` plus a secondary `(backend, upstream_prompt_id)`
/// index for correlating upstream WebSocket frames back to a task
/// (spec.md §4.5).
pub struct TaskStore {
    tasks: DashMap<TaskId, Task>,
    by_upstream: DashMap<(String, String), TaskId>,
    max_size: usize,
    events: broadcast::Sender<TaskEvent>,
}

impl TaskStore {
    pub fn new(max_size: usize) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(1024);
        Arc::new(Self {
            tasks: DashMap::new(),
            by_upstream: DashMap::new(),
            max_size,
            events: tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    fn publish(&self, task: &Task) {
        let _ = self.events.send(TaskEvent {
            task_id: task.task_id,
            state: task.state,
            backend: task.backend.clone(),
        });
    }

    /// Enqueue a new task in the `pending` state. Rejects with `QueueFull`
    /// once `max_size` pending+dispatching+dispatched tasks are outstanding
    /// (spec.md §5 "Queue Full" backpressure).
    pub fn submit(&self, client_id: Option<String>, payload: Payload) -> Result<TaskId, TaskError> {
        let outstanding = self
            .tasks
            .iter()
            .filter(|t| {
                matches!(
                    t.state,
                    TaskState::Pending | TaskState::Dispatching | TaskState::Dispatched
                )
            })
            .count();
        if outstanding >= self.max_size {
            return Err(TaskError::QueueFull(self.max_size));
        }

        let task_id = Uuid::new_v4();
        let task = Task::new(task_id, client_id, payload);
        self.publish(&task);
        self.tasks.insert(task_id, task);
        Ok(task_id)
    }

    pub fn get(&self, task_id: TaskId) -> Option<Task> {
        self.tasks.get(&task_id).map(|t| t.clone())
    }

    pub fn find_by_upstream(&self, backend: &str, upstream_prompt_id: &str) -> Option<TaskId> {
        self.by_upstream
            .get(&(backend.to_string(), upstream_prompt_id.to_string()))
            .map(|id| *id)
    }

    /// Every task currently in `pending`, oldest first (FIFO order for the
    /// dispatcher's waitlist, spec.md §4.6).
    pub fn pending_fifo(&self) -> Vec<TaskId> {
        let mut rows: Vec<(u64, TaskId)> = self
            .tasks
            .iter()
            .filter(|t| t.state == TaskState::Pending)
            .map(|t| (t.created_at_ms, t.task_id))
            .collect();
        rows.sort_by_key(|(created, _)| *created);
        rows.into_iter().map(|(_, id)| id).collect()
    }

    /// `(task_id, created_at_ms)` for every task waiting in the balancer's
    /// own FIFO, i.e. not yet charged against any backend (spec.md §4.9
    /// "aggregated view over all backends plus balancer-pending tasks").
    pub fn list_pending_summaries(&self) -> Vec<(TaskId, u64)> {
        self.tasks
            .iter()
            .filter(|t| t.state == TaskState::Pending)
            .map(|t| (t.task_id, t.created_at_ms))
            .collect()
    }

    /// Tasks in `dispatched` whose last transition is older than `cutoff_ms`
    /// (spec.md §4.6 "history poll fallback... older than twice the
    /// interval"). The history poller uses this to avoid re-polling tasks
    /// that only just dispatched.
    pub fn dispatched_older_than(&self, cutoff_ms: u64) -> Vec<Task> {
        self.tasks
            .iter()
            .filter(|t| t.state == TaskState::Dispatched && t.updated_at_ms <= cutoff_ms)
            .map(|t| t.clone())
            .collect()
    }

    /// Resolve an id to a task, trying it first as a `task_id`, then as an
    /// `upstream_prompt_id` against any backend (spec.md §4.9 "resolve id to
    /// Task"). Used by the proxy facade, which doesn't know which namespace
    /// a client-supplied id belongs to.
    pub fn find_by_any_id(&self, id: &str) -> Option<Task> {
        if let Ok(task_id) = id.parse::<TaskId>() {
            if let Some(task) = self.get(task_id) {
                return Some(task);
            }
        }
        self.tasks
            .iter()
            .find(|t| t.upstream_prompt_id.as_deref() == Some(id))
            .map(|t| t.clone())
    }

    /// All tasks currently dispatched to `backend` (used to re-queue on
    /// a healthy->unhealthy transition, spec.md §4.2).
    pub fn dispatched_on(&self, backend: &str) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|t| t.state == TaskState::Dispatched && t.backend.as_deref() == Some(backend))
            .map(|t| t.task_id)
            .collect()
    }

    fn transition(
        &self,
        task_id: TaskId,
        next: TaskState,
        mutate: impl FnOnce(&mut Task),
    ) -> Result<Task, TaskError> {
        let mut entry = self
            .tasks
            .get_mut(&task_id)
            .ok_or(TaskError::NotFound(task_id))?;
        if !entry.state.can_transition_to(next) {
            return Err(TaskError::InvalidTransition {
                task_id,
                from: entry.state,
                to: next,
            });
        }
        entry.state = next;
        entry.updated_at_ms = now_ms();
        mutate(&mut entry);
        let snapshot = entry.clone();
        drop(entry);
        self.publish(&snapshot);
        Ok(snapshot)
    }

    /// `pending -> dispatching`, reserving the task against a chosen backend
    /// ahead of the actual submit RPC (spec.md §4.6 step 4).
    pub fn mark_dispatching(&self, task_id: TaskId, backend: &str) -> Result<Task, TaskError> {
        let backend = backend.to_string();
        self.transition(task_id, TaskState::Dispatching, |t| {
            t.backend = Some(backend);
        })
    }

    /// `dispatching -> dispatched` on a successful submit RPC, recording the
    /// backend-assigned prompt id and indexing it for event correlation.
    pub fn mark_dispatched(&self, task_id: TaskId, upstream_prompt_id: String) -> Result<Task, TaskError> {
        let task = self.transition(task_id, TaskState::Dispatched, |t| {
            t.upstream_prompt_id = Some(upstream_prompt_id.clone());
        })?;
        if let Some(backend) = &task.backend {
            self.by_upstream
                .insert((backend.clone(), upstream_prompt_id), task_id);
        }
        Ok(task)
    }

    /// `dispatching -> pending`: the reservation could not be honored
    /// (submit RPC failed or backend dropped mid-reservation). Bumps
    /// `retries`; callers check `max_retries` before calling this again.
    pub fn retry(&self, task_id: TaskId) -> Result<Task, TaskError> {
        self.transition(task_id, TaskState::Pending, |t| {
            t.retries += 1;
            t.backend = None;
        })
    }

    /// `dispatched -> pending`: the owning backend went unhealthy.
    /// Re-enters the FIFO waitlist at its original priority.
    pub fn requeue_lost_backend(&self, task_id: TaskId) -> Result<Task, TaskError> {
        let task = self.get(task_id).ok_or(TaskError::NotFound(task_id))?;
        if let (Some(backend), Some(upstream)) = (&task.backend, &task.upstream_prompt_id) {
            self.by_upstream
                .remove(&(backend.clone(), upstream.clone()));
        }
        self.transition(task_id, TaskState::Pending, |t| {
            t.retries += 1;
            t.backend = None;
            t.upstream_prompt_id = None;
        })
    }

    pub fn mark_completed(&self, task_id: TaskId) -> Result<Task, TaskError> {
        self.transition(task_id, TaskState::Completed, |_| {})
    }

    pub fn mark_failed(&self, task_id: TaskId, error: String) -> Result<Task, TaskError> {
        self.transition(task_id, TaskState::Failed, |t| {
            t.error = Some(error);
        })
    }

    /// Cancel a task. Valid from `pending` (never dispatched) or
    /// `dispatched` (best-effort upstream cancel is the caller's job;
    /// this only updates local state, spec.md §4.6 "Cancellation").
    pub fn cancel(&self, task_id: TaskId) -> Result<Task, TaskError> {
        self.transition(task_id, TaskState::Cancelled, |_| {})
    }

    pub fn snapshot_all(&self) -> Vec<Task> {
        self.tasks.iter().map(|t| t.clone()).collect()
    }

    pub fn history(&self) -> HashMap<TaskId, Task> {
        self.tasks
            .iter()
            .map(|t| (t.task_id, t.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn submit_payload() -> Payload {
        Payload {
            prompt: json!({"nodes": {}}),
        }
    }

    #[test]
    fn test_submit_starts_pending() {
        let store = TaskStore::new(10);
        let id = store.submit(Some("client-1".into()), submit_payload()).unwrap();
        let task = store.get(id).unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.retries, 0);
    }

    #[test]
    fn test_submit_rejects_when_queue_full() {
        let store = TaskStore::new(1);
        store.submit(None, submit_payload()).unwrap();
        assert!(matches!(
            store.submit(None, submit_payload()),
            Err(TaskError::QueueFull(1))
        ));
    }

    #[test]
    fn test_full_happy_path_transition() {
        let store = TaskStore::new(10);
        let id = store.submit(None, submit_payload()).unwrap();

        store.mark_dispatching(id, "comfy-1").unwrap();
        assert_eq!(store.get(id).unwrap().state, TaskState::Dispatching);

        store.mark_dispatched(id, "upstream-123".into()).unwrap();
        assert_eq!(store.get(id).unwrap().state, TaskState::Dispatched);
        assert_eq!(store.find_by_upstream("comfy-1", "upstream-123"), Some(id));

        store.mark_completed(id).unwrap();
        assert_eq!(store.get(id).unwrap().state, TaskState::Completed);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let store = TaskStore::new(10);
        let id = store.submit(None, submit_payload()).unwrap();
        assert!(matches!(
            store.mark_completed(id),
            Err(TaskError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_requeue_lost_backend_clears_upstream_index() {
        let store = TaskStore::new(10);
        let id = store.submit(None, submit_payload()).unwrap();
        store.mark_dispatching(id, "comfy-1").unwrap();
        store.mark_dispatched(id, "upstream-123".into()).unwrap();

        store.requeue_lost_backend(id).unwrap();
        let task = store.get(id).unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.retries, 1);
        assert!(task.backend.is_none());
        assert_eq!(store.find_by_upstream("comfy-1", "upstream-123"), None);
    }

    #[test]
    fn test_cancel_from_pending() {
        let store = TaskStore::new(10);
        let id = store.submit(None, submit_payload()).unwrap();
        store.cancel(id).unwrap();
        assert_eq!(store.get(id).unwrap().state, TaskState::Cancelled);
    }

    #[test]
    fn test_pending_fifo_orders_by_creation() {
        let store = TaskStore::new(10);
        let a = store.submit(None, submit_payload()).unwrap();
        let b = store.submit(None, submit_payload()).unwrap();
        assert_eq!(store.pending_fifo(), vec![a, b]);
    }

    #[test]
    fn test_find_by_any_id_resolves_task_id_or_upstream_id() {
        let store = TaskStore::new(10);
        let id = store.submit(None, submit_payload()).unwrap();
        store.mark_dispatching(id, "comfy-1").unwrap();
        store.mark_dispatched(id, "upstream-123".into()).unwrap();

        assert_eq!(store.find_by_any_id(&id.to_string()).unwrap().task_id, id);
        assert_eq!(store.find_by_any_id("upstream-123").unwrap().task_id, id);
        assert!(store.find_by_any_id("no-such-id").is_none());
    }

    #[test]
    fn test_dispatched_older_than_filters_by_updated_at() {
        let store = TaskStore::new(10);
        let id = store.submit(None, submit_payload()).unwrap();
        store.mark_dispatching(id, "comfy-1").unwrap();
        store.mark_dispatched(id, "upstream-123".into()).unwrap();

        assert!(store.dispatched_older_than(0).is_empty());
        let far_future = now_ms() + 60_000;
        let found = store.dispatched_older_than(far_future);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].task_id, id);
    }
}
