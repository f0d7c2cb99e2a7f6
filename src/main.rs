#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]
use streamgate::artifacts::BucketUrlSigner;
use streamgate::constants::*;
use streamgate::token_source::{OpenAiTokenSource, UpstreamConfig};
use streamgate::*;

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

fn env_non_empty(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let args = Arc::new(Args::parse());

    let _log_guard = streamgate::logging::init_tracing(&args.log_dir, args.log_json);
    streamgate::logging::setup_panic_hook();

    let api_key = match env_non_empty(ENV_OPENAI_API_KEY) {
        Some(k) => k,
        None => {
            eprintln!("Error: {} environment variable is missing or empty.", ENV_OPENAI_API_KEY);
            eprintln!("Please set it in your .env file or environment.");
            std::process::exit(1);
        }
    };

    let client = match reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(args.connect_timeout_secs))
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let source = Arc::new(OpenAiTokenSource::new(
        client,
        UpstreamConfig {
            base_url: args.openai_base_url.clone(),
            api_key,
            model: args.model.clone(),
            temperature: args.temperature,
            max_tokens: args.max_tokens,
            pacing: Duration::from_millis(args.token_pacing_ms),
        },
    ));

    let bucket = match env_non_empty(ENV_BUCKET_NAME) {
        Some(b) => b,
        None => args.bucket.clone(),
    };
    let signing_secret = env_non_empty(ENV_SIGNING_SECRET);
    if signing_secret.is_none() {
        tracing::warn!("{} not set, artifact URLs will be unsigned", ENV_SIGNING_SECRET);
    }
    let storage = Arc::new(BucketUrlSigner::new(
        bucket.clone(),
        Duration::from_secs(args.url_expiry_secs),
        signing_secret,
    ));

    let state = Arc::new(AppState::new(args.clone(), source, storage));
    let app = build_router(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Streamgate listening on {} (model: {}, bucket: {})",
        addr,
        args.model,
        bucket
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown signal received");
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!("Server error: {}", e);
    }
}
