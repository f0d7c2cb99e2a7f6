use crate::artifacts::{ArtifactPublisher, ObjectStorage};
use crate::constants::*;
use crate::hardening::{CircuitBreaker, GuardedTokenSource};
use crate::relay::{RelaySettings, StreamRelay};
use crate::token_source::TokenSource;
use crate::types::*;
use axum::{middleware, routing::get, Router};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value_t = 8000)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value = DEFAULT_MODEL)]
    pub model: String,
    #[arg(long, default_value = OPENAI_BASE_URL)]
    pub openai_base_url: String,
    #[arg(long)]
    pub temperature: Option<f32>,
    #[arg(long)]
    pub max_tokens: Option<u32>,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    /// Longest silence tolerated from the upstream before a request times out
    #[arg(long, default_value_t = 60)]
    pub idle_timeout_secs: u64,
    /// Wall-clock budget for one generation
    #[arg(long, default_value_t = 300)]
    pub generation_timeout_secs: u64,
    /// Delay after each relayed fragment, for demos
    #[arg(long, default_value_t = 0)]
    pub token_pacing_ms: u64,
    #[arg(long, default_value = DEFAULT_BUCKET)]
    pub bucket: String,
    #[arg(long, default_value = DEFAULT_ARTIFACT_FOLDER)]
    pub artifact_folder: String,
    #[arg(long, default_value_t = 3600)]
    pub url_expiry_secs: u64,
    #[arg(long, default_value = "static")]
    pub static_dir: String,
    #[arg(long, default_value_t = 5)]
    pub circuit_breaker_threshold: u32,
    #[arg(long, default_value_t = 30)]
    pub circuit_breaker_recovery_secs: u64,
    #[arg(long, default_value = "logs")]
    pub log_dir: String,
    #[arg(long, default_value_t = false)]
    pub log_json: bool,
}

impl Args {
    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            generation_timeout: Duration::from_secs(self.generation_timeout_secs),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub args: Arc<Args>,
    /// Guarded by `circuit_breaker`; shared read-only by every connection.
    pub token_source: Arc<dyn TokenSource>,
    pub publisher: Arc<ArtifactPublisher>,
    pub relay_settings: RelaySettings,
    pub health: Arc<UpstreamHealth>,
    pub circuit_breaker: Arc<CircuitBreaker>,
}

impl AppState {
    pub fn new(
        args: Arc<Args>,
        source: Arc<dyn TokenSource>,
        storage: Arc<dyn ObjectStorage>,
    ) -> Self {
        let health = Arc::new(UpstreamHealth::default());
        let circuit_breaker = Arc::new(CircuitBreaker::new(
            args.circuit_breaker_threshold,
            Duration::from_secs(args.circuit_breaker_recovery_secs),
        ));
        let token_source: Arc<dyn TokenSource> = Arc::new(GuardedTokenSource::new(
            source,
            circuit_breaker.clone(),
            health.clone(),
        ));
        let publisher = Arc::new(ArtifactPublisher::new(storage, args.artifact_folder.clone()));

        Self {
            relay_settings: args.relay_settings(),
            args,
            token_source,
            publisher,
            health,
            circuit_breaker,
        }
    }

    /// Relays are per connection; collaborators are shared.
    pub fn new_relay(&self) -> StreamRelay {
        StreamRelay::new(
            self.token_source.clone(),
            self.publisher.clone(),
            self.relay_settings,
        )
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .route(QUERY_WS_PATH, get(crate::session::ws_query_handler))
        .route("/health", get(crate::health::liveness))
        .route("/readyz", get(crate::health::readiness));

    let static_dir = std::path::Path::new(&state.args.static_dir);
    if static_dir.is_dir() {
        tracing::info!("Serving static files from {}", static_dir.display());
        app = app.fallback_service(ServeDir::new(static_dir));
    } else {
        tracing::warn!(
            "Static directory {} not found, client page disabled",
            static_dir.display()
        );
    }

    app.layer(CorsLayer::permissive())
        .layer(middleware::from_fn(crate::logging::request_id_middleware))
        .with_state(state)
}
