pub mod error;
pub mod health;
pub mod http;
pub mod ws;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

pub use error::BackendError;

/// One decoded upstream WebSocket frame, tagged with the backend it came
/// from (spec.md §4.1 "emits decoded frames tagged with backend name").
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamFrame {
    pub backend: String,
    pub frame_type: String,
    pub prompt_id: Option<String>,
    pub data: Value,
}

impl UpstreamFrame {
    pub fn is_execution_success(&self) -> bool {
        self.frame_type == "execution_success" || self.frame_type == "executed"
    }

    pub fn is_execution_error(&self) -> bool {
        self.frame_type == "execution_error"
    }

    /// Whether this frame closes out a prompt's lifecycle, one way or
    /// another (spec.md §4.6 "Completion").
    pub fn is_terminal(&self) -> bool {
        self.is_execution_success() || self.is_execution_error()
    }
}

/// Result of `query_history` (spec.md §4.1).
#[derive(Debug, Clone)]
pub struct HistoryRecord {
    pub status: String,
    pub outputs: Value,
}

/// Result of `query_queue` (spec.md §4.1, §4.2 "refreshes the backend's
/// pending/running counts").
#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    pub pending: Vec<String>,
    pub running: Vec<String>,
}

/// Per-backend HTTP/WS adapter (spec.md §4.1). One implementation per
/// backend instance, constructed by the registry/dispatcher wiring and
/// held for the backend's lifetime.
#[async_trait]
pub trait BackendClient: Send + Sync {
    fn name(&self) -> &str;

    async fn submit(&self, payload: Value) -> Result<String, BackendError>;

    async fn query_history(&self, prompt_id: &str) -> Result<HistoryRecord, BackendError>;

    async fn query_queue(&self) -> Result<QueueSnapshot, BackendError>;

    async fn cancel(&self, prompt_id: &str) -> Result<(), BackendError>;

    /// Subscribe to this backend's decoded upstream frame stream. Multiple
    /// subscribers are fine; each gets every frame independently.
    fn subscribe_events(&self) -> broadcast::Receiver<UpstreamFrame>;
}

/// Registry of live `BackendClient`s, keyed by backend name, mirroring the
/// lifecycle of `BackendRegistry` entries (added/removed together).
pub struct BackendClientPool {
    clients: DashMap<String, Arc<dyn BackendClient>>,
}

impl BackendClientPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            clients: DashMap::new(),
        })
    }

    pub fn insert(&self, name: String, client: Arc<dyn BackendClient>) {
        self.clients.insert(name, client);
    }

    pub fn remove(&self, name: &str) {
        self.clients.remove(name);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BackendClient>> {
        self.clients.get(name).map(|c| c.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.clients.iter().map(|c| c.key().clone()).collect()
    }
}
