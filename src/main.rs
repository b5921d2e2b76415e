//! Online recommendation server (`curation-api`).
//!
//! Serves precomputed candidates through the ranking pipeline (§4.6),
//! coalescing concurrent requests per customer (§4.7) and falling back to
//! a fixed anonymous list when no customer id is known.

mod api;
mod middleware;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use curation_engine::coalesce::Coalescer;
use curation_engine::config::Config;
use curation_engine::context::{StockAffinitySource, UnknownStockAffinitySource};
use curation_engine::db::Database;
use curation_engine::ranking::RankingEngine;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone)]
struct AppState {
    db: Database,
    config: Arc<Config>,
    coalescer: Coalescer,
}

#[derive(Parser, Debug)]
#[command(name = "curation-api", about = "Serves personalized content recommendations")]
struct Args {
    /// Overrides `config.bind_addr`.
    #[arg(long, env = "BIND_ADDR")]
    bind_addr: Option<String>,

    /// Path to a TOML config file. Falls back to CURATION_CONFIG_PATH, then defaults.
    #[arg(long, env = "CURATION_CONFIG_PATH")]
    config: Option<String>,

    /// Overrides the `RUST_LOG`/default tracing filter.
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.log_level.as_deref());

    let mut config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("loading config from {path}"))?,
        None => Config::from_env()?,
    };
    if let Some(addr) = &args.bind_addr {
        config.bind_addr = addr.clone();
    }
    let config = Arc::new(config);

    let db = Database::open(&config.database_path)
        .with_context(|| format!("opening database at {}", config.database_path))?;

    let affinity: Arc<dyn StockAffinitySource> = Arc::new(UnknownStockAffinitySource);
    let engine = Arc::new(RankingEngine::new(&config));
    let coalescer = Coalescer::spawn(
        Arc::new(db.clone()),
        affinity,
        config.clone(),
        engine,
        config.effective_batch_workers(),
    );

    let state = AppState { db, config: config.clone(), coalescer };

    let app = Router::new()
        .route("/health", get(api::health_check))
        .route("/ready", get(api::readiness_check))
        .route("/api/recommendations/anonymous", get(api::get_anonymous_recommendations))
        .route("/api/recommendations/:cust_no", get(api::get_recommendations))
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(middleware::logging::request_logging))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "curation-api listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
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
    tracing::info!("shutdown signal received");
}

fn init_tracing(level_override: Option<&str>) {
    let filter = level_override
        .map(|l| l.to_string())
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "curation_engine=info,curation_api=info,tower_http=info".to_string());

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
