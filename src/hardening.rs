use crate::token_source::{TokenSource, TokenStream};
use crate::types::{RelayError, Result, UpstreamHealth};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

pub struct CircuitBreaker {
    state: Arc<RwLock<CircuitState>>,
    failure_threshold: u32,
    recovery_timeout: Duration,
    consecutive_failures: Arc<AtomicU32>,
    last_failure_time: Arc<RwLock<Option<Instant>>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(CircuitState::Closed)),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            consecutive_failures: Arc::new(AtomicU32::new(0)),
            last_failure_time: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn state(&self) -> CircuitState {
        *self.state.read().await
    }

    pub async fn check(&self) -> Result<()> {
        let mut state = self.state.write().await;

        if *state == CircuitState::Open {
            let last_failure = *self.last_failure_time.read().await;
            if let Some(last) = last_failure {
                if last.elapsed() > self.recovery_timeout {
                    tracing::info!("Circuit breaker transitioning to Half-Open");
                    *state = CircuitState::HalfOpen;
                    return Ok(());
                }
            }

            return Err(RelayError::UpstreamUnavailable("circuit breaker is open".to_string()).into());
        }
        Ok(())
    }

    pub async fn record_success(&self) {
        let mut state = self.state.write().await;
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if *state != CircuitState::Closed {
            tracing::info!("Circuit breaker transitioning to CLOSED");
            *state = CircuitState::Closed;
        }
    }

    pub async fn record_failure(&self) {
        let mut state = self.state.write().await;
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        *self.last_failure_time.write().await = Some(Instant::now());

        let reopen = *state == CircuitState::HalfOpen;
        if (failures >= self.failure_threshold || reopen) && *state != CircuitState::Open {
            tracing::error!(
                "Circuit breaker transitioning to OPEN ({} consecutive failures)",
                failures
            );
            *state = CircuitState::Open;
        }
    }
}

/// Wraps a token source with the breaker and health counters.
///
/// Only the open call is accounted; mid-stream failures belong to the relay.
/// Nothing is retried.
pub struct GuardedTokenSource {
    inner: Arc<dyn TokenSource>,
    breaker: Arc<CircuitBreaker>,
    health: Arc<UpstreamHealth>,
}

impl GuardedTokenSource {
    pub fn new(
        inner: Arc<dyn TokenSource>,
        breaker: Arc<CircuitBreaker>,
        health: Arc<UpstreamHealth>,
    ) -> Self {
        Self {
            inner,
            breaker,
            health,
        }
    }

    async fn open_guarded(&self, query: &str, prompt: &str) -> Result<TokenStream> {
        self.breaker.check().await?;
        match self.inner.open(query, prompt).await {
            Ok(stream) => {
                self.health.record_success();
                self.breaker.record_success().await;
                Ok(stream)
            }
            Err(e) => {
                self.health.record_failure();
                self.breaker.record_failure().await;
                Err(e)
            }
        }
    }
}

impl TokenSource for GuardedTokenSource {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn open<'a>(&'a self, query: &'a str, prompt: &'a str) -> BoxFuture<'a, Result<TokenStream>> {
        self.open_guarded(query, prompt).boxed()
    }

    /// A stalled open counts against the upstream like a failed one.
    fn open_abandoned(&self) -> BoxFuture<'_, ()> {
        async move {
            tracing::warn!("[⚙️  -> ☁️ ] Upstream open abandoned before completing");
            self.health.record_failure();
            self.breaker.record_failure().await;
        }
        .boxed()
    }
}
