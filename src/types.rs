use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RequestId(pub String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        crate::str_utils::prefix_chars(&self.0.simple().to_string(), 8).to_string()
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl RequestId {
    /// Request ids are scoped to a connection: `<conn-short>-<sequence>`.
    pub fn for_connection(connection: &ConnectionId, sequence: u64) -> Self {
        Self(format!("{}-{}", connection.short(), sequence))
    }

    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 12)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

use std::sync::atomic::{AtomicU32, AtomicU64};
use std::time::Instant;

pub struct UpstreamHealth {
    pub consecutive_failures: AtomicU32,
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub last_success: std::sync::RwLock<Option<Instant>>,
    pub last_failure: std::sync::RwLock<Option<Instant>>,
}

impl Default for UpstreamHealth {
    fn default() -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            last_success: std::sync::RwLock::new(None),
            last_failure: std::sync::RwLock::new(None),
        }
    }
}

impl UpstreamHealth {
    pub fn record_success(&self) {
        self.total_requests
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.consecutive_failures
            .store(0, std::sync::atomic::Ordering::Relaxed);
        if let Ok(mut last) = self.last_success.write() {
            *last = Some(Instant::now());
        }
    }

    pub fn record_failure(&self) {
        self.total_requests
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.failed_requests
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.consecutive_failures
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if let Ok(mut last) = self.last_failure.write() {
            *last = Some(Instant::now());
        }
    }
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Invalid query frame: {0}")]
    Validation(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(axum::http::StatusCode, String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Upstream timed out after {0:?}")]
    Timeout(Duration),

    #[error("Artifact publish failed: {0}")]
    ArtifactPublish(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Client-facing failure taxonomy. Every `RelayError` falls into exactly one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    UpstreamUnavailable,
    StreamInterrupted,
    Timeout,
    ArtifactPublish,
    Transport,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Validation => "validation",
            FailureKind::UpstreamUnavailable => "upstream_unavailable",
            FailureKind::StreamInterrupted => "stream_interrupted",
            FailureKind::Timeout => "timeout",
            FailureKind::ArtifactPublish => "artifact_publish",
            FailureKind::Transport => "transport",
        };
        write!(f, "{}", s)
    }
}

impl RelayError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RelayError::Validation(_) | RelayError::Serialization(_) => FailureKind::Validation,
            RelayError::UpstreamUnavailable(_) | RelayError::Upstream(_, _) => {
                FailureKind::UpstreamUnavailable
            }
            RelayError::StreamInterrupted(_) | RelayError::Network(_) | RelayError::Io(_) => {
                FailureKind::StreamInterrupted
            }
            RelayError::Timeout(_) => FailureKind::Timeout,
            RelayError::ArtifactPublish(_) => FailureKind::ArtifactPublish,
            RelayError::Transport(_) => FailureKind::Transport,
        }
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: RelayError,
    pub span_trace: SpanTrace,
}

impl ObservedError {
    pub fn kind(&self) -> FailureKind {
        self.inner.kind()
    }
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<RelayError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_status_is_unavailable() {
        let err: ObservedError = RelayError::Upstream(
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            "overloaded".to_string(),
        )
        .into();
        assert_eq!(err.kind(), FailureKind::UpstreamUnavailable);
        assert!(err.inner.to_string().contains("503"));
    }

    #[test]
    fn test_timeout_kind_and_message() {
        let err = RelayError::Timeout(Duration::from_secs(5));
        assert_eq!(err.kind(), FailureKind::Timeout);
        assert_eq!(err.to_string(), "Upstream timed out after 5s");
    }

    #[test]
    fn test_request_id_is_prefixed_by_connection() {
        let conn = ConnectionId::new();
        let rid = RequestId::for_connection(&conn, 3);
        assert!(rid.0.starts_with(&conn.short()));
        assert!(rid.0.ends_with("-3"));
    }

    #[test]
    fn test_health_counters() {
        let health = UpstreamHealth::default();
        health.record_failure();
        health.record_failure();
        health.record_success();
        let ord = std::sync::atomic::Ordering::Relaxed;
        assert_eq!(health.total_requests.load(ord), 3);
        assert_eq!(health.failed_requests.load(ord), 2);
        assert_eq!(health.consecutive_failures.load(ord), 0);
    }
}
