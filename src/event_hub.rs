//! Fans upstream backend WebSocket frames out to subscribed downstream
//! clients (spec.md §4.7). One reader task per backend consumes that
//! backend's `UpstreamFrame` broadcast channel (from `BackendClient`); the
//! Hub looks up the owning task, rewrites the frame onto a stable id, and
//! forwards it to whichever client subscribed for that task's `client_id`.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::backend::{BackendClientPool, UpstreamFrame};
use crate::dispatcher::Dispatcher;
use crate::task::TaskStore;

/// Downstream send-buffer capacity before a subscriber is judged a slow
/// consumer and disconnected (spec.md §4.7 "send buffer exceeds a
/// threshold").
const SUBSCRIBER_BUFFER: usize = 256;

/// One frame delivered to a downstream client WebSocket.
#[derive(Debug, Clone, Serialize)]
pub struct DownstreamFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub data: Value,
}

impl DownstreamFrame {
    fn close(reason: &'static str) -> Self {
        Self {
            frame_type: "close".to_string(),
            data: serde_json::json!({ "reason": reason }),
        }
    }
}

struct Subscriber {
    sender: mpsc::Sender<DownstreamFrame>,
    prompt_filter: Option<String>,
}

/// A handle returned by `subscribe`; dropping it unregisters the client.
pub struct Subscription {
    hub: Arc<EventHub>,
    client_id: String,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(&self.client_id);
    }
}

/// Keyed by `client_id` (spec.md §3 "Event subscription"). Only one live
/// subscriber per `client_id` is kept, matching ComfyUI's one-socket-per-
/// `clientId` convention: a fresh `/ws` connection for the same id replaces
/// whatever was registered before it.
pub struct EventHub {
    subscribers: DashMap<String, Subscriber>,
}

impl EventHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: DashMap::new(),
        })
    }

    /// Register a downstream client. `prompt_filter`, when set, restricts
    /// delivery to frames for that one `prompt_id` (spec.md §3).
    pub fn subscribe(
        self: &Arc<Self>,
        client_id: String,
        prompt_filter: Option<String>,
    ) -> (mpsc::Receiver<DownstreamFrame>, Subscription) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.insert(
            client_id.clone(),
            Subscriber {
                sender: tx,
                prompt_filter,
            },
        );
        (
            rx,
            Subscription {
                hub: self.clone(),
                client_id,
            },
        )
    }

    fn unsubscribe(&self, client_id: &str) {
        self.subscribers.remove(client_id);
    }

    /// Deliver one frame to its subscriber, if any (spec.md §4.7). Returns
    /// whether a subscriber existed and matched. A full send buffer
    /// disconnects the subscriber with a `slow_consumer` reason rather than
    /// blocking the reader task that feeds every backend's events.
    fn deliver(&self, client_id: &str, frame: DownstreamFrame, prompt_id: Option<&str>) {
        let Some(entry) = self.subscribers.get(client_id) else {
            return;
        };

        if let (Some(filter), Some(id)) = (&entry.prompt_filter, prompt_id) {
            if filter != id {
                return;
            }
        }

        match entry.sender.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(client_id, "downstream subscriber buffer full, closing as slow_consumer");
                let _ = entry.sender.try_send(DownstreamFrame::close("slow_consumer"));
                drop(entry);
                self.subscribers.remove(client_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                drop(entry);
                self.subscribers.remove(client_id);
            }
        }
    }

    /// Handle one decoded upstream frame from any backend (spec.md §4.7):
    /// look the owning task up by `(backend, upstream_prompt_id)`, rewrite
    /// it onto the task's stable `task_id`, route it to that task's
    /// `client_id`, and mirror terminal frames into the Dispatcher's
    /// completion path so state transitions don't require a history poll.
    fn handle_frame(&self, tasks: &TaskStore, dispatcher: &Dispatcher, frame: UpstreamFrame) {
        let Some(prompt_id) = frame.prompt_id.clone() else {
            return;
        };

        let Some(task_id) = tasks.find_by_upstream(&frame.backend, &prompt_id) else {
            debug!(backend = %frame.backend, prompt_id, "upstream frame for unknown/already-settled task, dropping");
            return;
        };

        let Some(task) = tasks.get(task_id) else {
            return;
        };

        let mut data = frame.data.clone();
        if let Value::Object(ref mut map) = data {
            map.insert("task_id".to_string(), Value::String(task_id.to_string()));
        }
        let outbound = DownstreamFrame {
            frame_type: frame.frame_type.clone(),
            data,
        };

        if let Some(client_id) = &task.client_id {
            self.deliver(client_id, outbound, Some(&prompt_id));
        }

        if frame.is_execution_success() {
            dispatcher.complete_task(task_id);
        } else if frame.is_execution_error() {
            dispatcher.fail_task(task_id, format!("upstream execution_error on {}", frame.backend));
        }
    }

    /// Spawn a reader task that drains `client`'s upstream event stream for
    /// as long as the hub and the backend client pool both live (spec.md
    /// §4.7 "Subscribes to every backend's WebSocket stream"). One task per
    /// backend, started at registration time and again whenever a backend
    /// is added at runtime (see `crate::main`'s wiring).
    pub fn spawn_reader(
        self: &Arc<Self>,
        backend: &str,
        clients: Arc<BackendClientPool>,
        tasks: Arc<TaskStore>,
        dispatcher: Arc<Dispatcher>,
        shutdown: Arc<tokio::sync::Notify>,
    ) {
        let hub = self.clone();
        let backend = backend.to_string();
        tokio::spawn(async move {
            let Some(client) = clients.get(&backend) else {
                return;
            };
            let mut rx = client.subscribe_events();
            loop {
                tokio::select! {
                    frame = rx.recv() => {
                        match frame {
                            Ok(frame) => hub.handle_frame(&tasks, &dispatcher, frame),
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(backend = %backend, skipped, "event hub reader lagged, frames dropped");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                        }
                    }
                    _ = shutdown.notified() => return,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendClientPool;
    use crate::config::{QueueConfig, SchedulerConfig};
    use crate::registry::BackendRegistry;
    use serde_json::json;

    fn new_dispatcher() -> Arc<Dispatcher> {
        Dispatcher::new(
            BackendRegistry::new(),
            TaskStore::new(10),
            BackendClientPool::new(),
            SchedulerConfig::default(),
            QueueConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_subscribe_and_deliver_routes_by_client_id() {
        let hub = EventHub::new();
        let (mut rx, _sub) = hub.subscribe("client-1".to_string(), None);

        hub.deliver(
            "client-1",
            DownstreamFrame {
                frame_type: "progress".to_string(),
                data: json!({}),
            },
            None,
        );

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.frame_type, "progress");
    }

    #[tokio::test]
    async fn test_deliver_respects_prompt_filter() {
        let hub = EventHub::new();
        let (mut rx, _sub) = hub.subscribe("client-1".to_string(), Some("wanted".to_string()));

        hub.deliver(
            "client-1",
            DownstreamFrame {
                frame_type: "progress".to_string(),
                data: json!({}),
            },
            Some("other"),
        );
        hub.deliver(
            "client-1",
            DownstreamFrame {
                frame_type: "progress".to_string(),
                data: json!({}),
            },
            Some("wanted"),
        );

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.frame_type, "progress");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handle_frame_rewrites_task_id_and_drives_completion() {
        let tasks = TaskStore::new(10);
        let dispatcher = new_dispatcher();
        let hub = EventHub::new();

        let task_id = tasks.submit(Some("client-1".to_string()), crate::task::Payload { prompt: json!({}) }).unwrap();
        tasks.mark_dispatching(task_id, "comfy-1").unwrap();
        tasks.mark_dispatched(task_id, "upstream-abc".to_string()).unwrap();

        let (mut rx, _sub) = hub.subscribe("client-1".to_string(), None);

        hub.handle_frame(
            &tasks,
            &dispatcher,
            UpstreamFrame {
                backend: "comfy-1".to_string(),
                frame_type: "execution_success".to_string(),
                prompt_id: Some("upstream-abc".to_string()),
                data: json!({"prompt_id": "upstream-abc"}),
            },
        );

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.data.get("task_id").unwrap(), &json!(task_id.to_string()));
        assert_eq!(tasks.get(task_id).unwrap().state, crate::task::TaskState::Completed);
    }

    #[tokio::test]
    async fn test_unknown_prompt_id_is_dropped_silently() {
        let tasks = TaskStore::new(10);
        let dispatcher = new_dispatcher();
        let hub = EventHub::new();

        hub.handle_frame(
            &tasks,
            &dispatcher,
            UpstreamFrame {
                backend: "comfy-1".to_string(),
                frame_type: "execution_success".to_string(),
                prompt_id: Some("never-seen".to_string()),
                data: json!({}),
            },
        );
        // No panic, nothing delivered: success.
    }

    #[tokio::test]
    async fn test_slow_consumer_is_disconnected() {
        let hub = EventHub::new();
        let (_rx, _sub) = hub.subscribe("client-1".to_string(), None);

        for _ in 0..SUBSCRIBER_BUFFER + 2 {
            hub.deliver(
                "client-1",
                DownstreamFrame {
                    frame_type: "progress".to_string(),
                    data: json!({}),
                },
                None,
            );
        }

        assert!(hub.subscribers.get("client-1").is_none());
    }
}
