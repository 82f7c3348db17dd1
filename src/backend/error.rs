use thiserror::Error;

/// Errors a `BackendClient` call can return (spec.md §4.1, §7).
#[derive(Error, Debug)]
pub enum BackendError {
    /// Backend returned 4xx for a submit call. Non-retryable; the task
    /// goes straight to `failed`.
    #[error("backend '{backend}' rejected submit: {detail}")]
    SubmitRejected { backend: String, detail: String },

    /// Network error on submit (connect refused, DNS, timeout at the
    /// transport level, etc.). Retryable up to `max_retries`.
    #[error("backend '{backend}' unavailable for submit: {source}")]
    SubmitUnavailable {
        backend: String,
        #[source]
        source: reqwest::Error,
    },

    /// Backend returned 5xx for a submit call (spec.md §4.1 "`SubmitUnavailable`
    /// on network/5xx"). No `reqwest::Error` to carry as a source here — the
    /// request did complete — so this is a distinct variant from
    /// `SubmitUnavailable`, but retried the same way.
    #[error("backend '{backend}' returned server error {status} on submit: {detail}")]
    SubmitServerError {
        backend: String,
        status: u16,
        detail: String,
    },

    /// `query_history` found no record for the given prompt id.
    #[error("backend '{backend}' has no history for prompt '{prompt_id}'")]
    NotFound { backend: String, prompt_id: String },

    /// Request exceeded the configured timeout.
    #[error("request to backend '{backend}' timed out after {timeout_ms}ms")]
    Timeout { backend: String, timeout_ms: u64 },

    /// Any other transport-level failure (connect refused, DNS, TLS, etc.).
    #[error("backend '{backend}' request failed: {source}")]
    Transport {
        backend: String,
        #[source]
        source: reqwest::Error,
    },

    /// Upstream returned a response body the client couldn't decode.
    #[error("backend '{backend}' returned an undecodable response: {1}")]
    Decode(String, #[source] serde_json::Error),
}

impl BackendError {
    pub fn backend_name(&self) -> &str {
        match self {
            BackendError::SubmitRejected { backend, .. }
            | BackendError::SubmitUnavailable { backend, .. }
            | BackendError::SubmitServerError { backend, .. }
            | BackendError::NotFound { backend, .. }
            | BackendError::Timeout { backend, .. }
            | BackendError::Transport { backend, .. } => backend,
            BackendError::Decode(backend, _) => backend,
        }
    }

    /// Whether the dispatcher should retry this submit (spec.md §4.6
    /// "On `SubmitUnavailable`: ... schedule a retry").
    pub fn is_retryable_submit(&self) -> bool {
        matches!(
            self,
            BackendError::SubmitUnavailable { .. }
                | BackendError::SubmitServerError { .. }
                | BackendError::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_is_not_retryable() {
        let err = BackendError::SubmitRejected {
            backend: "comfy-1".into(),
            detail: "bad prompt".into(),
        };
        assert!(!err.is_retryable_submit());
        assert_eq!(err.backend_name(), "comfy-1");
    }

    #[test]
    fn test_timeout_is_retryable() {
        let err = BackendError::Timeout {
            backend: "comfy-1".into(),
            timeout_ms: 3000,
        };
        assert!(err.is_retryable_submit());
    }

    #[test]
    fn test_submit_server_error_is_retryable() {
        let err = BackendError::SubmitServerError {
            backend: "comfy-1".into(),
            status: 502,
            detail: "bad gateway".into(),
        };
        assert!(err.is_retryable_submit());
        assert_eq!(err.backend_name(), "comfy-1");
    }
}
