//! Admin HTTP + management WebSocket surface (spec.md §4.8, §6). All
//! mutations go through the Registry or Task Store and publish events onto
//! the management channel, which is kept separate from the proxied ComfyUI
//! WebSocket (spec.md §4.8 "separate from the proxied ComfyUI WebSocket").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{delete, get, post};
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::BackendConfig;
use crate::registry::BackendEvent;
use crate::scheduler::Strategy;
use crate::task::{TaskEvent, TaskId};
use crate::App;

pub fn router() -> Router<Arc<App>> {
    Router::new()
        .route("/lb/stats", get(stats))
        .route("/lb/backends", get(list_backends).post(add_backend))
        .route("/lb/backends/{name}", delete(remove_backend))
        .route("/lb/backends/{name}/enable", post(enable_backend))
        .route("/lb/backends/{name}/disable", post(disable_backend))
        .route("/lb/tasks", get(list_tasks))
        .route("/lb/tasks/{task_id}", get(task_detail).delete(cancel_task))
        .route("/lb/health-check", post(trigger_health_check))
        .route("/lb/scheduler", get(get_scheduler))
        .route("/lb/scheduler/strategy/{strategy}", post(set_strategy))
        .route("/lb/ws", get(management_ws))
}

async fn stats(State(app): State<Arc<App>>) -> Json<Value> {
    Json(compute_stats(&app))
}

fn compute_stats(app: &App) -> Value {
    let backends = app.registry.snapshot();
    let tasks = app.tasks.snapshot_all();
    let mut by_state: std::collections::HashMap<&'static str, u64> = std::collections::HashMap::new();
    for task in &tasks {
        *by_state.entry(state_label(task.state)).or_insert(0) += 1;
    }

    json!({
        "backend_count": backends.len(),
        "backends": backends,
        "task_count": tasks.len(),
        "tasks_by_state": by_state,
        "scheduler": {
            "strategy": app.dispatcher.current_scheduler_config().strategy,
            "prefer_idle": app.dispatcher.current_scheduler_config().prefer_idle,
        },
    })
}

fn state_label(state: crate::task::TaskState) -> &'static str {
    use crate::task::TaskState::*;
    match state {
        Pending => "pending",
        Dispatching => "dispatching",
        Dispatched => "dispatched",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

async fn list_backends(State(app): State<Arc<App>>) -> Json<Value> {
    Json(json!(app.registry.snapshot()))
}

async fn add_backend(State(app): State<Arc<App>>, Json(config): Json<BackendConfig>) -> impl IntoResponse {
    if config.weight == 0 || config.max_queue == 0 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid_backend", "message": "weight and max_queue must be >= 1" })),
        )
            .into_response();
    }

    match app.add_backend(config).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(err) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "name_conflict", "message": err.to_string() })),
        )
            .into_response(),
    }
}

async fn remove_backend(State(app): State<Arc<App>>, Path(name): Path<String>) -> impl IntoResponse {
    match app.remove_backend(&name) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "backend_busy", "message": err.to_string() })),
        )
            .into_response(),
    }
}

async fn enable_backend(State(app): State<Arc<App>>, Path(name): Path<String>) -> impl IntoResponse {
    match app.registry.enable(&name) {
        Ok(()) => {
            app.dispatcher.notify_capacity();
            StatusCode::OK.into_response()
        }
        Err(err) => (StatusCode::NOT_FOUND, Json(json!({ "error": err.to_string() }))).into_response(),
    }
}

async fn disable_backend(State(app): State<Arc<App>>, Path(name): Path<String>) -> impl IntoResponse {
    match app.registry.disable(&name) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => (StatusCode::NOT_FOUND, Json(json!({ "error": err.to_string() }))).into_response(),
    }
}

async fn list_tasks(State(app): State<Arc<App>>) -> Json<Value> {
    Json(json!(app.tasks.snapshot_all()))
}

async fn task_detail(State(app): State<Arc<App>>, Path(task_id): Path<TaskId>) -> impl IntoResponse {
    match app.tasks.get(task_id) {
        Some(task) => Json(json!(task)).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({ "error": "not_found" }))).into_response(),
    }
}

async fn cancel_task(State(app): State<Arc<App>>, Path(task_id): Path<TaskId>) -> impl IntoResponse {
    match app.dispatcher.cancel(task_id).await {
        Ok(task) => Json(json!(task)).into_response(),
        Err(err) => (StatusCode::NOT_FOUND, Json(json!({ "error": err.to_string() }))).into_response(),
    }
}

async fn trigger_health_check(State(app): State<Arc<App>>) -> impl IntoResponse {
    app.health_trigger.notify_waiters();
    StatusCode::ACCEPTED
}

async fn get_scheduler(State(app): State<Arc<App>>) -> Json<Value> {
    let config = app.dispatcher.current_scheduler_config();
    Json(json!({ "strategy": config.strategy, "prefer_idle": config.prefer_idle }))
}

async fn set_strategy(State(app): State<Arc<App>>, Path(strategy): Path<String>) -> impl IntoResponse {
    match strategy.parse::<Strategy>() {
        Ok(strategy) => {
            app.dispatcher.set_strategy(strategy);
            StatusCode::OK.into_response()
        }
        Err(message) => (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response(),
    }
}

// --- Management WebSocket (spec.md §6 "Management WebSocket") ---

/// One message on the management channel. `#[serde(tag = "type")]` makes
/// each variant serialize as `{"type": "...", "data": ...}`, matching
/// spec.md §6's tagged-object shape exactly.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ManagementMessage {
    StatsUpdate { data: Value },
    BackendUpdate { data: BackendEvent },
    QueueUpdate { data: BackendEvent },
    TaskUpdate { data: TaskEvent },
}

/// Broadcasts `ManagementMessage`s to every `/lb/ws` subscriber. `dirty`
/// tracks whether a `stats_update` is owed; `run_relay` coalesces it to at
/// most one per 200ms (spec.md §6).
pub struct ManagementHub {
    tx: broadcast::Sender<ManagementMessage>,
    dirty: AtomicBool,
}

impl ManagementHub {
    pub fn new() -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(512);
        Arc::new(Self {
            tx,
            dirty: AtomicBool::new(true),
        })
    }

    fn publish(&self, message: ManagementMessage) {
        self.dirty.store(true, Ordering::Release);
        let _ = self.tx.send(message);
    }
}

/// Relays Registry and Task Store events onto the management channel, and
/// emits a coalesced `stats_update` at most every 200ms while something has
/// changed (spec.md §6).
pub async fn run_relay(app: Arc<App>, shutdown: Arc<tokio::sync::Notify>) {
    let mut backend_events = app.registry.subscribe();
    let mut task_events = app.tasks.subscribe();
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(200));

    loop {
        tokio::select! {
            event = backend_events.recv() => {
                if let Ok(event) = event {
                    let message = if matches!(event, BackendEvent::MetricsChanged { .. }) {
                        ManagementMessage::QueueUpdate { data: event }
                    } else {
                        ManagementMessage::BackendUpdate { data: event }
                    };
                    app.management.publish(message);
                }
            }
            event = task_events.recv() => {
                if let Ok(event) = event {
                    app.management.publish(ManagementMessage::TaskUpdate { data: event });
                }
            }
            _ = ticker.tick() => {
                if app.management.dirty.swap(false, Ordering::AcqRel) {
                    let _ = app.management.tx.send(ManagementMessage::StatsUpdate { data: compute_stats(&app) });
                }
            }
            _ = shutdown.notified() => return,
        }
    }
}

async fn management_ws(State(app): State<Arc<App>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_management_socket(app, socket))
}

async fn handle_management_socket(app: Arc<App>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let mut rx = app.management.tx.subscribe();

    loop {
        tokio::select! {
            event = rx.recv() => {
                let message = match event {
                    Ok(message) => message,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Ok(text) = serde_json::to_string(&message) else { continue };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(error = %err, "management websocket read error");
                        break;
                    }
                }
            }
        }
    }
}
