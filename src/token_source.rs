use crate::specs::openai::{parse_provider_line, LineEvent, OpenAiRequest};
use crate::types::*;
use futures_util::future::{self, BoxFuture};
use futures_util::stream::{self, BoxStream};
use futures_util::{FutureExt, Stream, StreamExt};
use std::time::Duration;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

/// Lazily pulled text fragments for one query. Dropping it releases the upstream.
pub type FragmentStream = BoxStream<'static, Result<String>>;

pub struct TokenStream {
    pub fragments: FragmentStream,
    /// Raw artifact identifiers for the publisher; empty for text-only backends.
    pub artifacts: Vec<String>,
}

impl TokenStream {
    pub fn new(fragments: FragmentStream) -> Self {
        Self {
            fragments,
            artifacts: Vec::new(),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = artifacts;
        self
    }
}

pub trait TokenSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Starts generation. Fails with `UpstreamUnavailable` if nothing could be opened.
    fn open<'a>(&'a self, query: &'a str, prompt: &'a str) -> BoxFuture<'a, Result<TokenStream>>;

    /// The caller gave up on an `open` that had not resolved yet.
    fn open_abandoned(&self) -> BoxFuture<'_, ()> {
        future::ready(()).boxed()
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Delay inserted after each fragment. Zero disables pacing.
    pub pacing: Duration,
}

impl UpstreamConfig {
    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

pub struct OpenAiTokenSource {
    client: reqwest::Client,
    config: UpstreamConfig,
}

impl OpenAiTokenSource {
    pub fn new(client: reqwest::Client, config: UpstreamConfig) -> Self {
        Self { client, config }
    }

    fn build_request(&self, query: &str, prompt: &str) -> OpenAiRequest {
        let mut request = OpenAiRequest::streaming(&self.config.model, prompt, query);
        request.temperature = self.config.temperature;
        request.max_tokens = self.config.max_tokens;
        request
    }

    async fn open_stream(&self, query: &str, prompt: &str) -> Result<TokenStream> {
        let request = self.build_request(query, prompt);
        tracing::debug!(
            "[⚙️  -> ☁️ ] Opening completion stream (model: {}, query: {} chars)",
            request.model,
            query.len()
        );

        let response = self
            .client
            .post(self.config.completions_url())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| RelayError::UpstreamUnavailable(e.to_string()))?;

        let status = response.status();
        tracing::info!("[☁️  -> ⚙️ ] Status: {}", status);
        if !status.is_success() {
            let error_body = match response.text().await {
                Ok(text) => text,
                Err(_) => "Unknown error".to_string(),
            };
            return Err(RelayError::Upstream(status, error_body).into());
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.starts_with("text/event-stream") {
            let body = match response.text().await {
                Ok(text) => text,
                Err(_) => String::new(),
            };
            tracing::error!(
                "[☁️  -> ⚙️ ] Expected an event stream, got {:?}: {}",
                content_type,
                crate::str_utils::first_n_chars_lossy(&body, 200)
            );
            return Err(RelayError::UpstreamUnavailable(format!(
                "unexpected content type {:?}",
                content_type
            ))
            .into());
        }

        let bytes_stream = response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other));
        let lines = FramedRead::new(
            tokio_util::io::StreamReader::new(bytes_stream),
            LinesCodec::new_with_max_length(crate::constants::MAX_SSE_LINE_BYTES),
        );

        Ok(TokenStream::new(fragment_stream(lines, self.config.pacing)))
    }
}

impl TokenSource for OpenAiTokenSource {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn open<'a>(&'a self, query: &'a str, prompt: &'a str) -> BoxFuture<'a, Result<TokenStream>> {
        self.open_stream(query, prompt).boxed()
    }
}

/// Turns chat-completion SSE lines into text fragments.
///
/// The stream ends on `[DONE]` or end of body. A provider error line, a payload
/// that is not JSON, or a broken body yields one `StreamInterrupted` item and then ends.
pub fn fragment_stream<S>(lines: S, pacing: Duration) -> FragmentStream
where
    S: Stream<Item = std::result::Result<String, LinesCodecError>> + Send + 'static,
{
    let fragments = stream::unfold((lines.boxed(), false), |(mut lines, finished)| async move {
        if finished {
            return None;
        }
        loop {
            let line = match lines.next().await {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    let err = RelayError::StreamInterrupted(e.to_string());
                    return Some((Err(err.into()), (lines, true)));
                }
                None => {
                    tracing::debug!("[☁️  -> ⚙️ ] Body ended without [DONE] marker");
                    return None;
                }
            };

            match parse_provider_line(&line) {
                LineEvent::Chunk(chunk) => {
                    if let Some(fragment) = chunk.fragment() {
                        return Some((Ok(fragment.to_string()), (lines, false)));
                    }
                }
                LineEvent::Done => {
                    tracing::debug!("[☁️  -> ⚙️ ] Stream end marker [DONE] received");
                    return None;
                }
                LineEvent::Error(err) => {
                    tracing::error!("[☁️  -> ⚙️ ] Stream Error: {}", err.error.message);
                    let err = RelayError::StreamInterrupted(err.error.message);
                    return Some((Err(err.into()), (lines, true)));
                }
                LineEvent::Malformed(detail) => {
                    tracing::error!("[☁️  -> ⚙️ ] {}", detail);
                    let err = RelayError::StreamInterrupted(detail);
                    return Some((Err(err.into()), (lines, true)));
                }
                LineEvent::Skip => {}
            }
        }
    });

    if pacing.is_zero() {
        fragments.boxed()
    } else {
        fragments
            .then(move |item| async move {
                tokio::time::sleep(pacing).await;
                item
            })
            .boxed()
    }
}
