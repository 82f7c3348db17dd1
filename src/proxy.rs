//! ComfyUI-compatible HTTP/WS entrypoint (spec.md §4.9). Translates client
//! requests into Task Store / Dispatcher / Event Hub operations; never
//! parses prompt node structure (spec.md §9 "opaque payload").

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::registry::BackendStatus;
use crate::task::{Payload, Task, TaskEvent, TaskId, TaskState};
use crate::App;

pub fn router() -> Router<Arc<App>> {
    Router::new()
        .route("/prompt", post(submit_prompt))
        .route("/queue", get(get_queue).post(cancel_queue))
        .route("/history", get(history_all))
        .route("/history/{id}", get(history_one))
        .route("/ws", get(ws_handler))
        .fallback(passthrough)
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(rename = "clientId")]
    client_id: String,
    #[serde(rename = "promptId")]
    prompt_id: Option<String>,
}

async fn ws_handler(
    State(app): State<Arc<App>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(app, socket, query.client_id, query.prompt_id))
}

async fn handle_socket(app: Arc<App>, socket: WebSocket, client_id: String, prompt_id: Option<String>) {
    let (mut sink, mut stream) = socket.split();
    let (mut rx, _subscription) = app.event_hub.subscribe(client_id.clone(), prompt_id);

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                let Ok(text) = serde_json::to_string(&frame) else { continue };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // clients don't send us anything meaningful
                    Some(Err(err)) => {
                        debug!(client_id, error = %err, "downstream websocket read error");
                        break;
                    }
                }
            }
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct PromptExtras {
    client_id: Option<String>,
}

async fn submit_prompt(State(app): State<Arc<App>>, body: Json<Value>) -> impl IntoResponse {
    let extras: PromptExtras = serde_json::from_value(body.0.clone()).unwrap_or_default();
    let payload = Payload { prompt: body.0 };

    let task_id = match app.dispatcher.submit(extras.client_id, payload) {
        Ok(id) => id,
        Err(err) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "queue_full", "message": err.to_string() })),
            )
                .into_response();
        }
    };

    match await_past_pending(&app, task_id, app.config.queue.submit_timeout).await {
        Some(task) => prompt_response(task),
        None => (
            StatusCode::ACCEPTED,
            Json(json!({ "task_id": task_id })),
        )
            .into_response(),
    }
}

fn prompt_response(task: Task) -> axum::response::Response {
    match task.state {
        TaskState::Dispatched | TaskState::Completed => (
            StatusCode::OK,
            Json(json!({
                "task_id": task.task_id,
                "prompt_id": task.upstream_prompt_id,
            })),
        )
            .into_response(),
        TaskState::Failed => (
            StatusCode::OK,
            Json(json!({
                "task_id": task.task_id,
                "error": task.error.unwrap_or_default(),
            })),
        )
            .into_response(),
        TaskState::Cancelled => (
            StatusCode::OK,
            Json(json!({ "task_id": task.task_id, "status": "cancelled" })),
        )
            .into_response(),
        TaskState::Pending | TaskState::Dispatching => (
            StatusCode::ACCEPTED,
            Json(json!({ "task_id": task.task_id })),
        )
            .into_response(),
    }
}

/// Wait until `task_id` leaves `pending`/`dispatching`, or `timeout`
/// elapses (spec.md §4.9 "blocks until dispatch, or until submit_timeout
/// elapses"). Returns `None` on timeout (caller falls back to 202).
async fn await_past_pending(app: &App, task_id: TaskId, timeout: Duration) -> Option<Task> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut events = app.tasks.subscribe();

    loop {
        if let Some(task) = app.tasks.get(task_id) {
            if !matches!(task.state, TaskState::Pending | TaskState::Dispatching) {
                return Some(task);
            }
        } else {
            return None;
        }

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return app.tasks.get(task_id);
        }

        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(TaskEvent { task_id: id, .. }) if id == task_id => continue,
                    Ok(_) => continue,
                    Err(_) => return app.tasks.get(task_id),
                }
            }
            _ = tokio::time::sleep(remaining) => return app.tasks.get(task_id),
        }
    }
}

async fn get_queue(State(app): State<Arc<App>>) -> Json<Value> {
    let backends = app.registry.snapshot();
    let balancer_pending: Vec<Value> = app
        .tasks
        .list_pending_summaries()
        .into_iter()
        .map(|(id, created_at_ms)| json!({ "task_id": id, "created_at_ms": created_at_ms }))
        .collect();

    Json(json!({
        "backends": backends,
        "balancer_pending": balancer_pending,
    }))
}

#[derive(Debug, Deserialize)]
struct CancelBody {
    #[serde(default)]
    delete: Vec<String>,
}

async fn cancel_queue(State(app): State<Arc<App>>, Json(body): Json<CancelBody>) -> impl IntoResponse {
    for id in &body.delete {
        let Some(task) = app.tasks.find_by_any_id(id) else {
            continue;
        };
        if let Err(err) = app.dispatcher.cancel(task.task_id).await {
            warn!(task_id = %task.task_id, error = %err, "cancel via /queue failed");
        }
    }
    StatusCode::OK
}

async fn history_one(State(app): State<Arc<App>>, Path(id): Path<String>) -> impl IntoResponse {
    let Some(task) = app.tasks.find_by_any_id(&id) else {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "not_found" }))).into_response();
    };
    history_for_task(&app, &task).await
}

async fn history_all(State(app): State<Arc<App>>) -> impl IntoResponse {
    let mut out = serde_json::Map::new();
    for task in app.tasks.snapshot_all() {
        let (Some(backend_name), Some(prompt_id)) = (&task.backend, &task.upstream_prompt_id) else {
            continue;
        };
        let Some(client) = app.clients.get(backend_name) else {
            continue;
        };
        if let Ok(record) = client.query_history(prompt_id).await {
            out.insert(
                prompt_id.clone(),
                json!({ "status": record.status, "outputs": record.outputs }),
            );
        }
    }
    Json(Value::Object(out)).into_response()
}

async fn history_for_task(app: &App, task: &Task) -> axum::response::Response {
    let (Some(backend_name), Some(prompt_id)) = (&task.backend, &task.upstream_prompt_id) else {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "not_found" }))).into_response();
    };
    let Some(client) = app.clients.get(backend_name) else {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "not_found" }))).into_response();
    };
    match client.query_history(prompt_id).await {
        Ok(record) => (
            StatusCode::OK,
            Json(json!({ prompt_id: { "status": record.status, "outputs": record.outputs } })),
        )
            .into_response(),
        Err(_) => (StatusCode::NOT_FOUND, Json(json!({ "error": "not_found" }))).into_response(),
    }
}

/// Deterministic-by-name-hash passthrough for read-only endpoints the core
/// doesn't otherwise know about (`/object_info`, `/system_stats`, etc. —
/// spec.md §1 lists these as external collaborators; this fallback is the
/// generic catch-all spec.md §4.9 still assigns to the Proxy Facade).
async fn passthrough(
    State(app): State<Arc<App>>,
    req: axum::extract::Request,
) -> impl IntoResponse {
    let path = req.uri().path().to_string();
    let backends = app.registry.snapshot();
    let healthy: Vec<_> = backends
        .into_iter()
        .filter(|b| b.status == BackendStatus::Healthy)
        .collect();
    if healthy.is_empty() {
        return (StatusCode::BAD_GATEWAY, "no healthy backend available").into_response();
    }

    let index = (hash_path(&path) as usize) % healthy.len();
    let backend = &healthy[index];
    let url = format!("http://{}:{}{}", backend.host, backend.port, path);

    match app.http.get(&url).send().await {
        Ok(resp) => {
            let status = resp.status();
            let body = resp.bytes().await.unwrap_or_default();
            (status, body).into_response()
        }
        Err(err) => {
            warn!(backend = %backend.name, path, error = %err, "passthrough request failed");
            (StatusCode::BAD_GATEWAY, "backend passthrough failed").into_response()
        }
    }
}

fn hash_path(path: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    path.hash(&mut hasher);
    hasher.finish()
}
