use crate::artifacts::ArtifactPublisher;
use crate::constants::{BUFFERED_FAILED_MESSAGE, STREAMING_FAILED_MESSAGE};
use crate::logging::RelayMetric;
use crate::protocol::{round_secs, OutboundFrame, QueryRequest};
use crate::token_source::{TokenSource, TokenStream};
use crate::types::*;
use futures_util::StreamExt;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    Idle,
    Dispatched,
    Streaming,
    Buffering,
    Completed,
    Failed,
}

impl RelayState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RelayState::Completed | RelayState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Completed,
    Failed(FailureKind),
}

/// Outbound half of a client connection.
pub trait FrameSink: Send {
    fn send_frame(&mut self, frame: OutboundFrame) -> impl Future<Output = Result<()>> + Send;

    /// Closes the connection. Later sends must fail without touching the wire.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    /// Longest wait for the upstream to open or to yield the next fragment.
    pub idle_timeout: Duration,
    /// Budget for a whole request, from dispatch to the last fragment.
    pub generation_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            generation_timeout: Duration::from_secs(300),
        }
    }
}

/// Space-joins fragments; the result is trimmed once at the end.
#[derive(Debug, Default)]
pub struct TextAccumulator {
    buffer: String,
    fragments: usize,
}

impl TextAccumulator {
    pub fn push(&mut self, fragment: &str) {
        self.buffer.push_str(fragment);
        self.buffer.push(' ');
        self.fragments += 1;
    }

    pub fn fragments(&self) -> usize {
        self.fragments
    }

    pub fn finish(self) -> String {
        self.buffer.trim().to_string()
    }
}

/// `deadline` is `None` when the generation budget is too large to represent.
async fn bounded<F: Future>(
    settings: RelaySettings,
    deadline: Option<Instant>,
    fut: F,
) -> Result<F::Output> {
    let wait = match deadline {
        Some(d) => settings
            .idle_timeout
            .min(d.saturating_duration_since(Instant::now())),
        None => settings.idle_timeout,
    };
    match tokio::time::timeout(wait, fut).await {
        Ok(v) => Ok(v),
        Err(_) => Err(RelayError::Timeout(wait).into()),
    }
}

/// Drives one query at a time from dispatch to exactly one terminal frame.
pub struct StreamRelay {
    source: Arc<dyn TokenSource>,
    publisher: Arc<ArtifactPublisher>,
    settings: RelaySettings,
    state: RelayState,
    history: Vec<RelayState>,
}

impl StreamRelay {
    pub fn new(
        source: Arc<dyn TokenSource>,
        publisher: Arc<ArtifactPublisher>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            source,
            publisher,
            settings,
            state: RelayState::Idle,
            history: vec![RelayState::Idle],
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// States visited by the most recent request, starting at `Idle`.
    pub fn history(&self) -> &[RelayState] {
        &self.history
    }

    fn transition(&mut self, next: RelayState) {
        tracing::trace!("[RELAY] {:?} -> {:?}", self.state, next);
        self.state = next;
        self.history.push(next);
    }

    /// Marks an in-flight request failed after its future was dropped.
    pub fn abort(&mut self) {
        if !self.state.is_terminal() && self.state != RelayState::Idle {
            tracing::info!("[RELAY] Aborting in-flight request in state {:?}", self.state);
            self.transition(RelayState::Failed);
        }
    }

    pub async fn run<S: FrameSink>(&mut self, sink: &mut S, request: &QueryRequest) -> RelayOutcome {
        self.state = RelayState::Idle;
        self.history.clear();
        self.history.push(RelayState::Idle);

        tracing::info!(
            "[⚙️  -> ☁️ ] Handling {} query via {} ({} chars, prompt: {:?})",
            if request.param.stream { "streaming" } else { "buffered" },
            self.source.name(),
            request.query.len(),
            crate::str_utils::first_n_chars_lossy(&request.prompt, 40)
        );

        match self.drive(sink, request).await {
            Ok(()) => {
                self.transition(RelayState::Completed);
                RelayOutcome::Completed
            }
            Err(e) => self.fail(sink, request, e).await,
        }
    }

    async fn drive<S: FrameSink>(&mut self, sink: &mut S, request: &QueryRequest) -> Result<()> {
        let started = Instant::now();
        let deadline = started.checked_add(self.settings.generation_timeout);
        self.transition(RelayState::Dispatched);

        let source = self.source.clone();
        let opened = match bounded(
            self.settings,
            deadline,
            source.open(&request.query, &request.prompt),
        )
        .await
        {
            Ok(opened) => opened?,
            Err(e) => {
                source.open_abandoned().await;
                return Err(e);
            }
        };
        let TokenStream {
            mut fragments,
            artifacts,
        } = opened;

        let mut text = TextAccumulator::default();
        let mut metric = RelayMetric::new(started);

        if request.param.stream {
            self.transition(RelayState::Streaming);
            while let Some(item) = bounded(self.settings, deadline, fragments.next()).await? {
                let fragment = item?;
                metric.record_fragment(&fragment);
                text.push(&fragment);
                sink.send_frame(OutboundFrame::token(fragment)).await?;
            }
        } else {
            self.transition(RelayState::Buffering);
            while let Some(item) = bounded(self.settings, deadline, fragments.next()).await? {
                let fragment = item?;
                metric.record_fragment(&fragment);
                text.push(&fragment);
            }
        }
        // Upstream is exhausted; release it before any further work.
        drop(fragments);

        let image_urls = self.publisher.publish(&artifacts);
        let frame = if request.param.stream {
            OutboundFrame::Metadata {
                execution_time: round_secs(started.elapsed()),
                image_urls,
                full_response: text.finish(),
            }
        } else {
            OutboundFrame::FullResult {
                value: text.finish(),
                image_urls,
            }
        };
        sink.send_frame(frame).await?;
        metric.log_summary(request.param.stream);
        Ok(())
    }

    async fn fail<S: FrameSink>(
        &mut self,
        sink: &mut S,
        request: &QueryRequest,
        err: ObservedError,
    ) -> RelayOutcome {
        let kind = err.kind();
        self.transition(RelayState::Failed);
        tracing::error!(
            failure = %kind,
            query = %crate::str_utils::first_n_chars_lossy(&request.query, 80),
            prompt = %crate::str_utils::first_n_chars_lossy(&request.prompt, 80),
            "[⚙️  -> 🌐 ] Relay failed: {}",
            err
        );

        // A dead transport cannot carry the error frame.
        if kind != FailureKind::Transport {
            let message = if request.param.stream {
                STREAMING_FAILED_MESSAGE
            } else {
                BUFFERED_FAILED_MESSAGE
            };
            if let Err(e) = sink.send_frame(OutboundFrame::error(message)).await {
                tracing::warn!("Could not deliver error frame: {}", e.inner);
            }
        }
        sink.close().await;
        RelayOutcome::Failed(kind)
    }
}
