use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

use super::error::BackendError;
use super::{BackendClient, HistoryRecord, QueueSnapshot, UpstreamFrame, ws};
use crate::config::BackendConfig;

/// Default implementation of `BackendClient` against a real ComfyUI
/// instance: `reqwest` for the HTTP surface, a background task running
/// `backend::ws::run_reader` for the WebSocket event stream (spec.md §4.1).
pub struct HttpBackendClient {
    name: String,
    base_url: String,
    client: reqwest::Client,
    events_tx: broadcast::Sender<UpstreamFrame>,
    shutdown: Arc<tokio::sync::Notify>,
    _reader_handle: JoinHandle<()>,
}

impl HttpBackendClient {
    pub fn new(config: &BackendConfig, timeout: Duration) -> Result<Self, BackendError> {
        let base_url = format!("http://{}:{}", config.host, config.port);
        let ws_url = format!("ws://{}:{}/ws?clientId=comfy-lb", config.host, config.port);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| BackendError::Transport {
                backend: config.name.clone(),
                source,
            })?;

        let (events_tx, _rx) = broadcast::channel(1024);
        let shutdown = Arc::new(tokio::sync::Notify::new());

        let reader_handle = tokio::spawn(ws::run_reader(
            config.name.clone(),
            ws_url,
            events_tx.clone(),
            shutdown.clone(),
        ));

        Ok(Self {
            name: config.name.clone(),
            base_url,
            client,
            events_tx,
            shutdown,
            _reader_handle: reader_handle,
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

impl Drop for HttpBackendClient {
    fn drop(&mut self) {
        self.shutdown.notify_waiters();
    }
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, payload: Value) -> Result<String, BackendError> {
        let url = format!("{}/prompt", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|source| BackendError::SubmitUnavailable {
                backend: self.name.clone(),
                source,
            })?;

        let status = response.status();
        if status.is_client_error() {
            let detail = response.text().await.unwrap_or_default();
            return Err(BackendError::SubmitRejected {
                backend: self.name.clone(),
                detail,
            });
        }
        if status.is_server_error() {
            let detail = response.text().await.unwrap_or_default();
            warn!(backend = %self.name, status = %status, detail, "submit returned server error");
            return Err(BackendError::SubmitServerError {
                backend: self.name.clone(),
                status: status.as_u16(),
                detail,
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|source| BackendError::Transport {
                backend: self.name.clone(),
                source,
            })?;

        body.get("prompt_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| BackendError::SubmitRejected {
                backend: self.name.clone(),
                detail: "response missing prompt_id".to_string(),
            })
    }

    async fn query_history(&self, prompt_id: &str) -> Result<HistoryRecord, BackendError> {
        let url = format!("{}/history/{}", self.base_url, prompt_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| BackendError::Transport {
                backend: self.name.clone(),
                source,
            })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound {
                backend: self.name.clone(),
                prompt_id: prompt_id.to_string(),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|source| BackendError::Transport {
                backend: self.name.clone(),
                source,
            })?;

        let entry = body
            .get(prompt_id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound {
                backend: self.name.clone(),
                prompt_id: prompt_id.to_string(),
            })?;

        let status = entry
            .get("status")
            .and_then(|s| s.get("status_str"))
            .and_then(|s| s.as_str())
            .unwrap_or("unknown")
            .to_string();
        let outputs = entry.get("outputs").cloned().unwrap_or(Value::Null);

        Ok(HistoryRecord { status, outputs })
    }

    async fn query_queue(&self) -> Result<QueueSnapshot, BackendError> {
        let url = format!("{}/queue", self.base_url);
        let body: Value = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| BackendError::Transport {
                backend: self.name.clone(),
                source,
            })?
            .json()
            .await
            .map_err(|source| BackendError::Transport {
                backend: self.name.clone(),
                source,
            })?;

        let extract_ids = |key: &str| -> Vec<String> {
            body.get(key)
                .and_then(|v| v.as_array())
                .map(|entries| {
                    entries
                        .iter()
                        .filter_map(|entry| entry.get(1).and_then(|v| v.as_str()))
                        .map(|s| s.to_string())
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(QueueSnapshot {
            pending: extract_ids("queue_pending"),
            running: extract_ids("queue_running"),
        })
    }

    async fn cancel(&self, prompt_id: &str) -> Result<(), BackendError> {
        let url = format!("{}/queue", self.base_url);
        let body = json!({ "delete": [prompt_id] });
        // Best-effort (spec.md §4.1): a failed cancel call doesn't block
        // the local task transition to `cancelled`.
        if let Err(err) = self.client.post(&url).json(&body).send().await {
            warn!(backend = %self.name, prompt_id, error = %err, "best-effort cancel failed");
        }
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<UpstreamFrame> {
        self.events_tx.subscribe()
    }
}
