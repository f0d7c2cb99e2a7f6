use axum::{
    body::Body,
    http::{Request, Response},
    middleware::Next,
};
use std::panic;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info};
use tracing::{info_span, Instrument};
use tracing_appender::non_blocking::WorkerGuard;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Creates `log_dir` if needed. Failure is reported on stderr, since tracing is not up yet.
pub fn ensure_log_dir(log_dir: &str) -> bool {
    match std::fs::create_dir_all(log_dir) {
        Ok(()) => true,
        Err(e) => {
            eprintln!("Warning: could not create log directory {}: {}", log_dir, e);
            eprintln!("File logging is disabled for this run.");
            false
        }
    }
}

/// Installs the global subscriber: stdout, a daily rolling file, and span traces.
///
/// The returned guard flushes the file writer on drop and must outlive the server.
pub fn init_tracing(log_dir: &str, json_file_log: bool) -> WorkerGuard {
    use tracing_subscriber::prelude::*;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "streamgate=debug,tower_http=info".into(),
    };

    // Without a log directory only stdout logging remains.
    let (non_blocking, guard) = if ensure_log_dir(log_dir) {
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "streamgate.log"))
    } else {
        tracing_appender::non_blocking(std::io::sink())
    };

    let file_layer = if json_file_log {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .with(tracing_error::ErrorLayer::default())
        .init();

    guard
}

pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let request_id = match req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => Uuid::new_v4().to_string(),
    };
    if let Ok(val) = request_id.parse() {
        req.headers_mut().insert(REQUEST_ID_HEADER, val);
    }

    let span = info_span!("request", request_id = %request_id, path = %req.uri().path());
    let mut response = next.run(req).instrument(span).await;
    if let Ok(val) = request_id.parse() {
        response.headers_mut().insert(REQUEST_ID_HEADER, val);
    }
    response
}

/// Per-request delivery statistics, logged once the terminal frame is out.
pub struct RelayMetric {
    started: Instant,
    pub fragments: usize,
    pub text_chars: usize,
    pub first_fragment: Option<Duration>,
}

impl RelayMetric {
    pub fn new(started: Instant) -> Self {
        Self {
            started,
            fragments: 0,
            text_chars: 0,
            first_fragment: None,
        }
    }

    pub fn record_fragment(&mut self, fragment: &str) {
        if self.first_fragment.is_none() {
            self.first_fragment = Some(self.started.elapsed());
        }
        self.fragments += 1;
        self.text_chars += fragment.chars().count();
    }

    pub fn log_summary(&self, streaming: bool) {
        let first = match self.first_fragment {
            Some(d) => format!("{}ms", d.as_millis()),
            None => "-".to_string(),
        };
        info!(
            target: "streamgate::relay",
            "[STREAM END] Mode: {} | Fragments: {} | Text: {} chars | First: {} | Total: {}ms",
            if streaming { "stream" } else { "buffer" },
            self.fragments,
            self.text_chars,
            first,
            self.started.elapsed().as_millis()
        );
    }
}
