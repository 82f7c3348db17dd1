//! Upstream backend WebSocket reader with reconnect/backoff (spec.md §4.1
//! "reconnected with exponential backoff starting at 1s, capped at 30s,
//! with full jitter; each successful reconnect resets the backoff").

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use rand::Rng;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use super::UpstreamFrame;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Runs until `shutdown` fires. Connects to `ws_url`, decodes every text
/// frame into an `UpstreamFrame`, and publishes it on `tx`. On any
/// disconnect it reconnects after a full-jitter backoff delay, resetting
/// the delay to `INITIAL_BACKOFF` after every successful connection.
pub async fn run_reader(
    backend: String,
    ws_url: String,
    tx: broadcast::Sender<UpstreamFrame>,
    shutdown: Arc<tokio::sync::Notify>,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let connect = tokio::select! {
            result = tokio_tungstenite::connect_async(&ws_url) => result,
            _ = shutdown.notified() => return,
        };

        match connect {
            Ok((stream, _response)) => {
                info!(backend = %backend, "connected to upstream event stream");
                backoff = INITIAL_BACKOFF;

                let (_write, mut read) = stream.split();
                loop {
                    tokio::select! {
                        frame = read.next() => {
                            match frame {
                                Some(Ok(WsMessage::Text(text))) => {
                                    if let Some(parsed) = parse_frame(&backend, &text) {
                                        let _ = tx.send(parsed);
                                    }
                                }
                                Some(Ok(WsMessage::Binary(_))) => {
                                    debug!(backend = %backend, "ignoring binary upstream frame");
                                }
                                Some(Ok(WsMessage::Close(_))) | None => {
                                    warn!(backend = %backend, "upstream event stream closed");
                                    break;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(err)) => {
                                    warn!(backend = %backend, error = %err, "upstream event stream error");
                                    break;
                                }
                            }
                        }
                        _ = shutdown.notified() => return,
                    }
                }
            }
            Err(err) => {
                warn!(backend = %backend, error = %err, "failed to connect to upstream event stream");
            }
        }

        let jittered = Duration::from_millis(rand::thread_rng().gen_range(0..=backoff.as_millis() as u64));
        tokio::select! {
            _ = tokio::time::sleep(jittered) => {}
            _ = shutdown.notified() => return,
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Decode one ComfyUI-style `{"type": ..., "data": {...}}` text frame.
/// Frames this balancer doesn't understand are dropped rather than
/// propagated as errors: an unrecognized frame is not a failure.
fn parse_frame(backend: &str, text: &str) -> Option<UpstreamFrame> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let frame_type = value.get("type")?.as_str()?.to_string();
    let data = value.get("data").cloned().unwrap_or(serde_json::Value::Null);
    let prompt_id = data
        .get("prompt_id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    Some(UpstreamFrame {
        backend: backend.to_string(),
        frame_type,
        prompt_id,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_extracts_prompt_id() {
        let text = r#"{"type":"execution_success","data":{"prompt_id":"abc-123"}}"#;
        let frame = parse_frame("comfy-1", text).unwrap();
        assert_eq!(frame.backend, "comfy-1");
        assert_eq!(frame.frame_type, "execution_success");
        assert_eq!(frame.prompt_id.as_deref(), Some("abc-123"));
        assert!(frame.is_terminal());
    }

    #[test]
    fn test_parse_frame_missing_type_is_none() {
        let text = r#"{"data":{}}"#;
        assert!(parse_frame("comfy-1", text).is_none());
    }

    #[test]
    fn test_parse_frame_invalid_json_is_none() {
        assert!(parse_frame("comfy-1", "not json").is_none());
    }

    #[test]
    fn test_non_terminal_frame() {
        let text = r#"{"type":"progress","data":{"prompt_id":"abc"}}"#;
        let frame = parse_frame("comfy-1", text).unwrap();
        assert!(!frame.is_terminal());
    }
}
