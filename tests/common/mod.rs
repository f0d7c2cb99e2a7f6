#![allow(dead_code)]

use futures_util::future::BoxFuture;
use futures_util::stream::{self, StreamExt};
use futures_util::FutureExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use streamgate::artifacts::{ArtifactPublisher, ObjectStorage};
use streamgate::protocol::OutboundFrame;
use streamgate::relay::{FrameSink, RelaySettings, StreamRelay};
use streamgate::token_source::{TokenSource, TokenStream};
use streamgate::types::*;

/// Sets its flag when the fragment stream it lives in is dropped.
pub struct DropFlag(pub Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Fake upstream producing a fixed fragment list.
#[derive(Default)]
pub struct ScriptedSource {
    pub fragments: Vec<String>,
    pub artifacts: Vec<String>,
    pub fail_open: bool,
    /// Fails the pull after this many fragments were produced.
    pub fail_after: Option<usize>,
    pub delay: Duration,
    /// Time `open` takes before resolving.
    pub open_delay: Duration,
    pub opens: Arc<AtomicUsize>,
    pub released: Arc<AtomicBool>,
}

impl ScriptedSource {
    pub fn new(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn failing_open() -> Self {
        Self {
            fail_open: true,
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn with_artifacts(mut self, artifacts: &[&str]) -> Self {
        self.artifacts = artifacts.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }
}

impl TokenSource for ScriptedSource {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn open<'a>(&'a self, _query: &'a str, _prompt: &'a str) -> BoxFuture<'a, Result<TokenStream>> {
        async move {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if !self.open_delay.is_zero() {
                tokio::time::sleep(self.open_delay).await;
            }
            if self.fail_open {
                return Err(RelayError::UpstreamUnavailable("connection refused".into()).into());
            }
            let mut items: Vec<Result<String>> =
                self.fragments.iter().cloned().map(Ok).collect();
            if let Some(n) = self.fail_after {
                items.truncate(n);
                items.push(Err(RelayError::StreamInterrupted("upstream reset".into()).into()));
            }
            let delay = self.delay;
            let guard = DropFlag(self.released.clone());
            let fragments = stream::unfold(
                (items.into_iter(), guard),
                move |(mut items, guard)| async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let item = items.next()?;
                    Some((item, (items, guard)))
                },
            )
            .boxed();
            Ok(TokenStream::new(fragments).with_artifacts(self.artifacts.clone()))
        }
        .boxed()
    }
}

#[derive(Default)]
pub struct SinkLog {
    pub frames: Vec<OutboundFrame>,
    pub closed: bool,
    pub attempts_after_close: usize,
}

/// In-memory `FrameSink`; clones share the same log.
#[derive(Clone, Default)]
pub struct RecordingSink {
    pub log: Arc<Mutex<SinkLog>>,
    /// Sends fail once this many frames were delivered.
    pub fail_after: Option<usize>,
}

impl RecordingSink {
    pub fn failing_after(n: usize) -> Self {
        Self {
            fail_after: Some(n),
            ..Default::default()
        }
    }

    pub fn frames(&self) -> Vec<OutboundFrame> {
        self.log.lock().unwrap().frames.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.log.lock().unwrap().closed
    }

    pub fn attempts_after_close(&self) -> usize {
        self.log.lock().unwrap().attempts_after_close
    }
}

impl FrameSink for RecordingSink {
    async fn send_frame(&mut self, frame: OutboundFrame) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        if log.closed {
            log.attempts_after_close += 1;
            return Err(RelayError::Transport("closed".into()).into());
        }
        if let Some(n) = self.fail_after {
            if log.frames.len() >= n {
                log.closed = true;
                return Err(RelayError::Transport("client gone".into()).into());
            }
        }
        log.frames.push(frame);
        Ok(())
    }

    async fn close(&mut self) {
        self.log.lock().unwrap().closed = true;
    }
}

/// Storage that formats deterministic URLs, or fails on demand.
pub struct MemoryStorage {
    pub fail: bool,
    pub calls: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }
}

impl ObjectStorage for MemoryStorage {
    fn presign(&self, folder: &str, identifiers: &[String]) -> Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(RelayError::ArtifactPublish("access denied".into()).into());
        }
        Ok(identifiers
            .iter()
            .map(|id| format!("https://bucket.test/{}/{}", folder, id))
            .collect())
    }
}

pub fn fast_settings() -> RelaySettings {
    RelaySettings {
        idle_timeout: Duration::from_secs(5),
        generation_timeout: Duration::from_secs(10),
    }
}

pub fn relay_with(source: Arc<dyn TokenSource>, storage: Arc<dyn ObjectStorage>) -> StreamRelay {
    StreamRelay::new(
        source,
        Arc::new(ArtifactPublisher::new(storage, "generated_images")),
        fast_settings(),
    )
}

pub fn relay_for(source: ScriptedSource) -> StreamRelay {
    relay_with(Arc::new(source), Arc::new(MemoryStorage::new()))
}

pub fn token_values(frames: &[OutboundFrame]) -> Vec<String> {
    frames
        .iter()
        .filter_map(|f| match f {
            OutboundFrame::Token { value } => Some(value.clone()),
            _ => None,
        })
        .collect()
}

/// Serves `app` on an ephemeral loopback port.
pub async fn serve(app: axum::Router) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Chat-completion SSE body for the given content deltas, ending with `[DONE]`.
pub fn sse_body(fragments: &[&str]) -> String {
    let mut body = String::from(
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"}}]}\n\n",
    );
    for f in fragments {
        let chunk = serde_json::json!({
            "choices": [{ "index": 0, "delta": { "content": f } }]
        });
        body.push_str(&format!("data: {}\n\n", chunk));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

#[derive(Clone, Default)]
pub struct SeenRequests(pub Arc<Mutex<Vec<(Option<String>, serde_json::Value)>>>);

impl SeenRequests {
    pub fn all(&self) -> Vec<(Option<String>, serde_json::Value)> {
        self.0.lock().unwrap().clone()
    }
}

/// Fake completions endpoint answering every request with `status` and an event-stream `body`.
pub async fn fake_upstream(status: u16, body: String) -> (String, SeenRequests) {
    fake_upstream_with(status, "text/event-stream", body).await
}

pub async fn fake_upstream_with(
    status: u16,
    content_type: &'static str,
    body: String,
) -> (String, SeenRequests) {
    use axum::http::{header, HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::Json;

    let seen = SeenRequests::default();
    let recorder = seen.clone();
    let app = axum::Router::new().route(
        "/v1/chat/completions",
        post(move |headers: HeaderMap, Json(request): Json<serde_json::Value>| {
            let recorder = recorder.clone();
            let body = body.clone();
            async move {
                let auth = headers
                    .get(header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string());
                recorder.0.lock().unwrap().push((auth, request));
                (
                    StatusCode::from_u16(status).unwrap(),
                    [(header::CONTENT_TYPE, content_type)],
                    body,
                )
            }
        }),
    );
    let addr = serve(app).await;
    (format!("http://{}/v1", addr), seen)
}

pub fn upstream_config(base_url: &str) -> streamgate::token_source::UpstreamConfig {
    streamgate::token_source::UpstreamConfig {
        base_url: base_url.to_string(),
        api_key: "test-key".to_string(),
        model: "gpt-3.5-turbo".to_string(),
        temperature: None,
        max_tokens: None,
        pacing: Duration::ZERO,
    }
}
