use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod auth;
mod compress;
mod config;
mod convert;
mod errors;
mod fault;
mod jobs;
mod metrics;
mod middleware;
mod models;
mod pool;
mod proxy;
mod store;
mod stream;
mod tokenizer;
mod upstream;

use compress::cache::SummaryCache;
use compress::{CompressorConfig, ContextCompressor};
use store::{KeyValueStore, SqliteStore, NS_APIKEYS, NS_CONFIG, NS_CREDENTIALS, NS_LOGS, NS_STATS};

/// Shared application state passed to handlers and jobs.
pub struct AppState {
    pub config: config::Config,
    pub store: Arc<SqliteStore>,
    pub pool: Arc<pool::CredentialPool>,
    pub upstream: Arc<upstream::UpstreamClient>,
    pub breaker: fault::CircuitBreaker,
    pub limiter: fault::RateLimiter,
    pub metrics: metrics::Metrics,
    pub conv_ids: convert::ConversationIds,
    pub tools: convert::tools::ToolConverter,
    pub compressor: Arc<ContextCompressor>,
    pub api_keys: middleware::auth::ApiKeyStore,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Parser, Debug)]
#[command(name = "kirogate", about = "OpenAI/Anthropic-compatible Kiro gateway")]
struct Cli {
    /// Override the PORT env var.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config::log_filter()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        tracing::error!("fatal: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let mut cfg = config::load()?;
    let cli = Cli::parse();
    if let Some(port) = cli.port {
        cfg.port = port;
    }

    let store = Arc::new(SqliteStore::connect(&cfg.database_url).await?);
    let pool = Arc::new(pool::CredentialPool::new());
    let upstream = Arc::new(upstream::UpstreamClient::new(&cfg.region));
    let api_keys = middleware::auth::ApiKeyStore::new();
    let metrics = metrics::Metrics::new();

    load_persisted_state(&store, &pool, &api_keys, &metrics).await?;

    let summarizer = Arc::new(proxy::summarizer::UpstreamSummarizer::new(
        pool.clone(),
        upstream.clone(),
    ));
    let compressor = Arc::new(ContextCompressor::new(
        SummaryCache::new(store.clone()),
        summarizer,
        CompressorConfig {
            enabled: cfg.enable_compression,
            ..Default::default()
        },
    ));

    let state = Arc::new(AppState {
        limiter: fault::RateLimiter::new(cfg.rate_limit_per_minute),
        config: cfg,
        store,
        pool,
        upstream,
        breaker: fault::CircuitBreaker::default(),
        metrics,
        conv_ids: convert::ConversationIds::new(),
        tools: convert::tools::ToolConverter::new(),
        compressor,
        api_keys,
        started_at: chrono::Utc::now(),
    });

    apply_stored_settings(&state).await;
    jobs::spawn(state.clone());

    let app = Router::new()
        .route("/health", get(health))
        .route("/v1/chat/completions", post(proxy::chat::chat_completions))
        .route("/v1/messages", post(proxy::messages::messages))
        .route("/v1/messages/count_tokens", post(proxy::messages::count_tokens))
        .route("/v1/models", get(proxy::models_api::list_models))
        .nest("/api", api::api_router(state.clone()))
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    tracing::info!(
        port = state.config.port,
        credentials = state.pool.len(),
        "kirogate listening"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down, persisting state");
    jobs::snapshot::persist_all(&state).await?;
    Ok(())
}

async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn load_persisted_state(
    store: &Arc<SqliteStore>,
    pool: &Arc<pool::CredentialPool>,
    api_keys: &middleware::auth::ApiKeyStore,
    metrics: &metrics::Metrics,
) -> anyhow::Result<()> {
    for (key, value) in store.list(NS_CREDENTIALS).await? {
        match serde_json::from_value::<models::credential::CredentialRecord>(value) {
            Ok(record) => pool.add(record),
            Err(e) => tracing::warn!(key, "skipping unreadable credential record: {}", e),
        }
    }

    let mut keys = Vec::new();
    for (key, value) in store.list(NS_APIKEYS).await? {
        match serde_json::from_value::<models::apikey::ApiKeyRecord>(value) {
            Ok(record) => keys.push(record),
            Err(e) => tracing::warn!(key, "skipping unreadable API key record: {}", e),
        }
    }
    api_keys.load(keys);

    if let Some(stats) = store.get(NS_STATS, "proxy").await? {
        metrics.restore(&stats);
    }
    if let Some(logs) = store.get(NS_LOGS, "requests").await? {
        if let Some(entries) = logs.get("entries") {
            if let Ok(entries) = serde_json::from_value(entries.clone()) {
                metrics.restore_logs(entries);
            }
        }
    }

    tracing::info!(credentials = pool.len(), "persisted state loaded");
    Ok(())
}

/// Re-apply `config/settings` (scheduling policy, compression knobs)
/// saved by a previous run.
async fn apply_stored_settings(state: &Arc<AppState>) {
    let stored = match state.store.get(NS_CONFIG, "settings").await {
        Ok(Some(v)) => v,
        _ => return,
    };
    if let Some(policy) = stored
        .get("scheduling_policy")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
    {
        state.pool.set_policy(policy);
    }
    if let Some(compressor) = stored.get("compressor") {
        let mut cfg = state.compressor.config();
        if let Some(v) = compressor.get("enabled").and_then(|v| v.as_bool()) {
            cfg.enabled = v;
        }
        if let Some(v) = compressor.get("auto_compress").and_then(|v| v.as_bool()) {
            cfg.auto_compress = v;
        }
        if let Some(v) = compressor.get("keep_count").and_then(|v| v.as_u64()) {
            cfg.keep_count = v as usize;
        }
        if let Some(v) = compressor.get("token_threshold").and_then(|v| v.as_u64()) {
            cfg.token_threshold = v;
        }
        state.compressor.set_config(cfg);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
