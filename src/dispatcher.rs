//! Match-maker pairing pending tasks with backend capacity (spec.md §4.6).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::{info, warn};

use crate::backend::BackendClientPool;
use crate::config::{QueueConfig, SchedulerConfig};
use crate::registry::BackendRegistry;
use crate::scheduler::{self, Strategy};
use crate::task::{Payload, Task, TaskError, TaskId, TaskState, TaskStore};

/// Single logical dispatch worker. Holds the two conditions from spec.md
/// §4.6: `pending_signal` (a task entered `pending`) and `capacity_signal`
/// (capacity may have increased).
pub struct Dispatcher {
    registry: Arc<BackendRegistry>,
    tasks: Arc<TaskStore>,
    clients: Arc<BackendClientPool>,
    scheduler_config: ArcSwap<SchedulerConfig>,
    queue: QueueConfig,
    pending_signal: tokio::sync::Notify,
    capacity_signal: tokio::sync::Notify,
    shutdown: tokio::sync::Notify,
    round_robin_cursor: AtomicUsize,
    draining: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<BackendRegistry>,
        tasks: Arc<TaskStore>,
        clients: Arc<BackendClientPool>,
        scheduler_config: SchedulerConfig,
        queue: QueueConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            tasks,
            clients,
            scheduler_config: ArcSwap::from_pointee(scheduler_config),
            queue,
            pending_signal: tokio::sync::Notify::new(),
            capacity_signal: tokio::sync::Notify::new(),
            shutdown: tokio::sync::Notify::new(),
            round_robin_cursor: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
        })
    }

    pub fn notify_pending(&self) {
        self.pending_signal.notify_waiters();
    }

    pub fn notify_capacity(&self) {
        self.capacity_signal.notify_waiters();
    }

    pub fn current_scheduler_config(&self) -> SchedulerConfig {
        (**self.scheduler_config.load()).clone()
    }

    /// Live strategy switch (spec.md §6 `POST /lb/scheduler/strategy/{strategy}`).
    /// Takes effect on the next selection, never mid-dispatch.
    pub fn set_strategy(&self, strategy: Strategy) {
        let mut current = self.current_scheduler_config();
        current.strategy = strategy;
        self.scheduler_config.store(Arc::new(current));
    }

    pub fn set_prefer_idle(&self, prefer_idle: bool) {
        let mut current = self.current_scheduler_config();
        current.prefer_idle = prefer_idle;
        self.scheduler_config.store(Arc::new(current));
    }

    /// Accept a new task into the queue and wake the dispatch loop.
    pub fn submit(
        &self,
        client_id: Option<String>,
        payload: Payload,
    ) -> Result<TaskId, TaskError> {
        let task_id = self.tasks.submit(client_id, payload)?;
        self.notify_pending();
        Ok(task_id)
    }

    /// Cancel a task (spec.md §4.6 "Cancellation"). A no-op success for
    /// tasks already in a terminal state.
    pub async fn cancel(&self, task_id: TaskId) -> Result<Task, TaskError> {
        let task = self.tasks.get(task_id).ok_or(TaskError::NotFound(task_id))?;

        match task.state {
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled => Ok(task),
            TaskState::Pending => {
                let cancelled = self.tasks.cancel(task_id)?;
                self.notify_capacity();
                Ok(cancelled)
            }
            TaskState::Dispatching => {
                let cancelled = self.tasks.cancel(task_id)?;
                if let Some(backend) = &cancelled.backend {
                    self.registry.release_reservation(backend);
                }
                self.notify_capacity();
                Ok(cancelled)
            }
            TaskState::Dispatched => {
                if let (Some(backend), Some(upstream)) =
                    (task.backend.clone(), task.upstream_prompt_id.clone())
                {
                    if let Some(client) = self.clients.get(&backend) {
                        let _ = client.cancel(&upstream).await;
                    }
                }
                let cancelled = self.tasks.cancel(task_id)?;
                if let Some(backend) = &cancelled.backend {
                    self.registry.release_running_or_pending(backend);
                }
                self.notify_capacity();
                Ok(cancelled)
            }
        }
    }

    /// Drive a task to `completed`, releasing its backend's capacity. Used
    /// by the Event Hub on a terminal upstream frame and by the history
    /// poll fallback. A no-op if the task is already gone (cancelled).
    pub fn complete_task(&self, task_id: TaskId) {
        if let Ok(task) = self.tasks.mark_completed(task_id) {
            if let Some(backend) = &task.backend {
                self.registry.release_running_or_pending(backend);
            }
            self.notify_capacity();
        }
    }

    pub fn fail_task(&self, task_id: TaskId, message: String) {
        if let Ok(task) = self.tasks.mark_failed(task_id, message) {
            if let Some(backend) = &task.backend {
                self.registry.release_running_or_pending(backend);
            }
            self.notify_capacity();
        }
    }

    /// Stop picking up new pending tasks. Any submit call already in
    /// flight is allowed to finish; `dispatched` tasks are left untouched
    /// (spec.md §5 "Cancellation and timeouts").
    pub fn begin_shutdown(&self) {
        self.draining.store(true, Ordering::Release);
        self.pending_signal.notify_waiters();
        self.shutdown.notify_waiters();
    }

    /// The dispatch loop. Runs until `begin_shutdown` is called.
    pub async fn run(self: Arc<Self>) {
        loop {
            if self.draining.load(Ordering::Acquire) {
                info!("dispatcher draining, no longer accepting new dispatches");
                return;
            }

            let Some(task_id) = self.tasks.pending_fifo().into_iter().next() else {
                tokio::select! {
                    _ = self.pending_signal.notified() => {}
                    _ = self.shutdown.notified() => {}
                }
                continue;
            };

            let scheduler_config = self.current_scheduler_config();
            let snapshot = self.registry.snapshot();
            let cands = scheduler::candidates(&snapshot, scheduler_config.prefer_idle);
            let cursor = self.round_robin_cursor.load(Ordering::Acquire);

            let Some(chosen) = scheduler::select(scheduler_config.strategy, &cands, cursor) else {
                // NoCapacity (spec.md §7: internal, never surfaced). Wait for
                // a capacity signal, but re-poll periodically in case a
                // signal was missed between our snapshot and the wait.
                tokio::select! {
                    _ = self.capacity_signal.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                    _ = self.shutdown.notified() => {}
                }
                continue;
            };

            let backend_name = chosen.name.clone();
            if scheduler_config.strategy == Strategy::RoundRobin {
                self.round_robin_cursor.fetch_add(1, Ordering::AcqRel);
            }

            // Reserve-or-reject: Registry lock acquired before TaskStore
            // (spec.md §5 lock ordering). If the reservation loses a race
            // against a concurrent probe/removal, loop around and re-pick.
            if !self.registry.try_reserve(&backend_name) {
                continue;
            }

            let task = match self.tasks.mark_dispatching(task_id, &backend_name) {
                Ok(task) => task,
                Err(err) => {
                    warn!(task_id = %task_id, error = %err, "failed to mark task dispatching after reserve");
                    self.registry.release_reservation(&backend_name);
                    continue;
                }
            };

            self.submit_to_backend(task, backend_name).await;
        }
    }

    async fn submit_to_backend(self: &Arc<Self>, task: Task, backend_name: String) {
        let prompt = task.payload.prompt;

        let Some(client) = self.clients.get(&backend_name) else {
            self.registry.release_reservation(&backend_name);
            let _ = self.tasks.retry(task.task_id);
            self.notify_pending();
            return;
        };

        match client.submit(prompt).await {
            Ok(upstream_prompt_id) => {
                self.registry.confirm_reservation_as_pending(&backend_name);
                if let Err(err) = self.tasks.mark_dispatched(task.task_id, upstream_prompt_id) {
                    warn!(task_id = %task.task_id, error = %err, "failed to mark task dispatched");
                }
            }
            Err(err) if err.is_retryable_submit() => {
                self.registry.release_reservation(&backend_name);
                if task.retries < self.queue.max_retries {
                    let tasks = self.tasks.clone();
                    let dispatcher = self.clone();
                    let task_id = task.task_id;
                    let retry_interval = self.queue.retry_interval;
                    tokio::spawn(async move {
                        tokio::time::sleep(retry_interval).await;
                        if tasks.retry(task_id).is_ok() {
                            dispatcher.notify_pending();
                        }
                    });
                } else if let Err(mark_err) = self
                    .tasks
                    .mark_failed(task.task_id, format!("SubmitExhausted: {err}"))
                {
                    warn!(task_id = %task.task_id, error = %mark_err, "failed to mark task failed after retries exhausted");
                }
            }
            Err(err) => {
                self.registry.release_reservation(&backend_name);
                if let Err(mark_err) = self.tasks.mark_failed(task.task_id, err.to_string()) {
                    warn!(task_id = %task.task_id, error = %mark_err, "failed to mark task failed after non-retryable submit error");
                }
            }
        }
    }
}

/// History-poll fallback (spec.md §4.6 "Completion"): a `dispatched` task
/// normally reaches a terminal state via an Event Hub-mirrored upstream
/// frame. This loop covers the gap where the upstream WS reader is
/// mid-reconnect (spec.md §4.7 "while disconnected, the history poll
/// fallback drives completion") by directly polling `/history` for any task
/// that has sat in `dispatched` for more than twice the health-check
/// interval.
pub async fn run_history_poll_fallback(
    dispatcher: Arc<Dispatcher>,
    tasks: Arc<TaskStore>,
    clients: Arc<BackendClientPool>,
    interval: Duration,
    shutdown: Arc<tokio::sync::Notify>,
) {
    let cutoff_age_ms = interval.as_millis() as u64 * 2;
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.notified() => return,
        }

        let cutoff = crate::task::now_ms().saturating_sub(cutoff_age_ms);
        for task in tasks.dispatched_older_than(cutoff) {
            poll_one(&dispatcher, &clients, &task).await;
        }
    }
}

async fn poll_one(dispatcher: &Arc<Dispatcher>, clients: &Arc<BackendClientPool>, task: &Task) {
    let (Some(backend_name), Some(upstream_id)) = (&task.backend, &task.upstream_prompt_id) else {
        return;
    };
    let Some(client) = clients.get(backend_name) else {
        return;
    };

    match client.query_history(upstream_id).await {
        Ok(record) if record.status == "error" => {
            dispatcher.fail_task(task.task_id, format!("history poll: backend reported {}", record.status));
        }
        Ok(_record) => {
            // Any other recorded status (e.g. "success") means the prompt
            // finished; completion detail lives in `outputs`, which the
            // core doesn't parse (spec.md §9 opaque payload).
            dispatcher.complete_task(task.task_id);
        }
        Err(crate::backend::BackendError::NotFound { .. }) => {
            // Still running upstream (or not started yet); try again next tick.
        }
        Err(err) => {
            warn!(task_id = %task.task_id, backend = %backend_name, error = %err, "history poll fallback check failed, will retry next tick");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendClient, BackendClientPool, BackendError, HistoryRecord, QueueSnapshot, UpstreamFrame};
    use crate::config::BackendConfig;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;

    /// In-process stand-in for `HttpBackendClient` (spec.md §8's own plan
    /// for testing the dispatcher: a fake `BackendClient`, not a real
    /// ComfyUI instance). `submit` behavior is scripted up front.
    struct FakeClient {
        name: String,
        behavior: FakeSubmit,
        calls: AtomicUsize,
        events: tokio::sync::broadcast::Sender<UpstreamFrame>,
    }

    enum FakeSubmit {
        AlwaysRejected,
        AlwaysServerError,
        FailThenSucceed(usize),
    }

    impl FakeClient {
        fn new(name: &str, behavior: FakeSubmit) -> Arc<dyn BackendClient> {
            let (events, _rx) = tokio::sync::broadcast::channel(16);
            Arc::new(Self {
                name: name.to_string(),
                behavior,
                calls: AtomicUsize::new(0),
                events,
            })
        }
    }

    #[async_trait]
    impl BackendClient for FakeClient {
        fn name(&self) -> &str {
            &self.name
        }

        async fn submit(&self, _payload: Value) -> Result<String, BackendError> {
            let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                FakeSubmit::AlwaysRejected => Err(BackendError::SubmitRejected {
                    backend: self.name.clone(),
                    detail: "bad prompt".to_string(),
                }),
                FakeSubmit::AlwaysServerError => Err(BackendError::SubmitServerError {
                    backend: self.name.clone(),
                    status: 503,
                    detail: "overloaded".to_string(),
                }),
                FakeSubmit::FailThenSucceed(fail_count) => {
                    if attempt < *fail_count {
                        Err(BackendError::SubmitServerError {
                            backend: self.name.clone(),
                            status: 503,
                            detail: "overloaded".to_string(),
                        })
                    } else {
                        Ok(format!("upstream-{attempt}"))
                    }
                }
            }
        }

        async fn query_history(&self, prompt_id: &str) -> Result<HistoryRecord, BackendError> {
            Err(BackendError::NotFound {
                backend: self.name.clone(),
                prompt_id: prompt_id.to_string(),
            })
        }

        async fn query_queue(&self) -> Result<QueueSnapshot, BackendError> {
            Ok(QueueSnapshot::default())
        }

        async fn cancel(&self, _prompt_id: &str) -> Result<(), BackendError> {
            Ok(())
        }

        fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<UpstreamFrame> {
            self.events.subscribe()
        }
    }

    fn backend_config(name: &str) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            port: 8188,
            weight: 1,
            max_queue: 2,
            enabled: true,
        }
    }

    fn healthy_registry(name: &str) -> Arc<BackendRegistry> {
        let registry = BackendRegistry::new();
        registry.add(backend_config(name)).unwrap();
        registry.record_probe_success(name, 1);
        registry
    }

    fn submit_payload() -> Payload {
        Payload {
            prompt: json!({"nodes": {}}),
        }
    }

    async fn wait_for_terminal(tasks: &Arc<TaskStore>, task_id: TaskId) -> Task {
        for _ in 0..300 {
            if let Some(task) = tasks.get(task_id) {
                if matches!(
                    task.state,
                    TaskState::Dispatched | TaskState::Completed | TaskState::Failed | TaskState::Cancelled
                ) {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} never left pending/dispatching");
    }

    /// spec.md §4.6 step 6 "On `SubmitRejected`: decrement reserved,
    /// transition to `failed` (non-retryable)" — this is exactly the path
    /// that used to get stuck in `dispatching` forever.
    #[tokio::test]
    async fn test_submit_rejected_fails_task_and_releases_reservation() {
        let registry = healthy_registry("comfy-1");
        let tasks = TaskStore::new(10);
        let clients = BackendClientPool::new();
        clients.insert("comfy-1".to_string(), FakeClient::new("comfy-1", FakeSubmit::AlwaysRejected));

        let dispatcher = Dispatcher::new(
            registry.clone(),
            tasks.clone(),
            clients,
            SchedulerConfig::default(),
            QueueConfig::default(),
        );
        let run_handle = tokio::spawn(dispatcher.clone().run());

        let task_id = dispatcher.submit(None, submit_payload()).unwrap();
        let task = wait_for_terminal(&tasks, task_id).await;

        assert_eq!(task.state, TaskState::Failed);
        assert!(task.error.unwrap().contains("rejected submit"));
        assert_eq!(registry.get("comfy-1").unwrap().reserved, 0);

        dispatcher.begin_shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(1), run_handle).await;
    }

    /// `SubmitServerError` (5xx) is retryable (spec.md §4.1): the task
    /// should bounce back to `pending` and eventually dispatch once the
    /// backend starts accepting again.
    #[tokio::test]
    async fn test_submit_unavailable_retries_then_succeeds() {
        let registry = healthy_registry("comfy-1");
        let tasks = TaskStore::new(10);
        let clients = BackendClientPool::new();
        clients.insert(
            "comfy-1".to_string(),
            FakeClient::new("comfy-1", FakeSubmit::FailThenSucceed(2)),
        );

        let mut queue = QueueConfig::default();
        queue.max_retries = 5;
        queue.retry_interval = Duration::from_millis(5);

        let dispatcher = Dispatcher::new(
            registry.clone(),
            tasks.clone(),
            clients,
            SchedulerConfig::default(),
            queue,
        );
        let run_handle = tokio::spawn(dispatcher.clone().run());

        let task_id = dispatcher.submit(None, submit_payload()).unwrap();
        let task = wait_for_terminal(&tasks, task_id).await;

        assert_eq!(task.state, TaskState::Dispatched);
        assert!(task.upstream_prompt_id.is_some());
        assert!(task.retries >= 2);

        dispatcher.begin_shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(1), run_handle).await;
    }

    /// Once `max_retries` is exhausted the task must still reach a terminal
    /// state (testable property #3, spec.md §8), not get stuck retrying
    /// forever.
    #[tokio::test]
    async fn test_submit_unavailable_exhausts_retries_and_fails() {
        let registry = healthy_registry("comfy-1");
        let tasks = TaskStore::new(10);
        let clients = BackendClientPool::new();
        clients.insert(
            "comfy-1".to_string(),
            FakeClient::new("comfy-1", FakeSubmit::AlwaysServerError),
        );

        let mut queue = QueueConfig::default();
        queue.max_retries = 2;
        queue.retry_interval = Duration::from_millis(5);

        let dispatcher = Dispatcher::new(
            registry.clone(),
            tasks.clone(),
            clients,
            SchedulerConfig::default(),
            queue,
        );
        let run_handle = tokio::spawn(dispatcher.clone().run());

        let task_id = dispatcher.submit(None, submit_payload()).unwrap();
        let task = wait_for_terminal(&tasks, task_id).await;

        assert_eq!(task.state, TaskState::Failed);
        assert!(task.error.unwrap().contains("SubmitExhausted"));
        assert_eq!(registry.get("comfy-1").unwrap().reserved, 0);

        dispatcher.begin_shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(1), run_handle).await;
    }

    /// spec.md §4.6 "Cancellation": "If in `pending`/`dispatching`:
    /// transition directly to `cancelled`" — exercised here without racing
    /// the dispatch loop, by driving the task into `dispatching` by hand.
    #[tokio::test]
    async fn test_cancel_while_dispatching_releases_reservation() {
        let registry = healthy_registry("comfy-1");
        let tasks = TaskStore::new(10);
        let clients = BackendClientPool::new();
        clients.insert("comfy-1".to_string(), FakeClient::new("comfy-1", FakeSubmit::AlwaysRejected));

        let dispatcher = Dispatcher::new(
            registry.clone(),
            tasks.clone(),
            clients,
            SchedulerConfig::default(),
            QueueConfig::default(),
        );

        let task_id = tasks.submit(None, submit_payload()).unwrap();
        assert!(registry.try_reserve("comfy-1"));
        tasks.mark_dispatching(task_id, "comfy-1").unwrap();

        let cancelled = dispatcher.cancel(task_id).await.unwrap();
        assert_eq!(cancelled.state, TaskState::Cancelled);
        assert_eq!(registry.get("comfy-1").unwrap().reserved, 0);

        // Cancelling an already-terminal task is a no-op success (spec.md §4.6).
        let again = dispatcher.cancel(task_id).await.unwrap();
        assert_eq!(again.state, TaskState::Cancelled);
    }
}
