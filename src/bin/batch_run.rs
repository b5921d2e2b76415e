//! Batch runner binary (`curation-batch`).
//!
//! Loads config, opens the store, runs one scoring pass over every user,
//! and exits. Intended to be invoked on a schedule (cron, k8s CronJob);
//! a single run is the unit of work, not a long-lived process.

use anyhow::{Context, Result};
use clap::Parser;
use curation_engine::batch::run_batch_dry;
use curation_engine::config::Config;
use curation_engine::db::Database;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "curation-batch", about = "Runs one batch scoring pass over all users")]
struct Args {
    /// Path to a TOML config file. Falls back to CURATION_CONFIG_PATH, then defaults.
    #[arg(long, env = "CURATION_CONFIG_PATH")]
    config: Option<String>,

    /// Compute candidates but skip persisting them.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Override the interaction-log window (days) used to train the CF model.
    #[arg(long)]
    cf_window_days: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("loading config from {path}"))?,
        None => Config::from_env()?,
    };
    if let Some(days) = args.cf_window_days {
        config.cf_interactions_window_days = days;
    }

    let db = Database::open(&config.database_path)
        .with_context(|| format!("opening database at {}", config.database_path))?;

    if args.dry_run {
        tracing::info!("dry run requested; batch scoring will run but results will not be persisted");
    }

    let mut shutdown = Box::pin(shutdown_signal());
    let mut run = Box::pin(run_batch_dry(&db, &config, args.dry_run));

    tokio::select! {
        result = &mut run => {
            let summary = result.context("batch run failed")?;
            tracing::info!(
                users_processed = summary.users_processed,
                users_skipped = summary.users_skipped,
                records_saved = summary.records_saved,
                dry_run = args.dry_run,
                "batch run complete"
            );
        }
        _ = &mut shutdown => {
            tracing::warn!("shutdown signal received; granting in-flight users a grace period before exit");
            match tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, &mut run).await {
                Ok(result) => {
                    let summary = result.context("batch run failed")?;
                    tracing::info!(
                        users_processed = summary.users_processed,
                        users_skipped = summary.users_skipped,
                        records_saved = summary.records_saved,
                        dry_run = args.dry_run,
                        "batch run complete after shutdown signal"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        grace_period_secs = SHUTDOWN_GRACE_PERIOD.as_secs(),
                        "grace period elapsed; exiting without completing remaining users"
                    );
                }
            }
        }
    }

    Ok(())
}

/// How long a shutdown signal waits for in-flight per-user work to finish
/// before the process exits regardless (§10 graceful shutdown).
const SHUTDOWN_GRACE_PERIOD: std::time::Duration = std::time::Duration::from_secs(30);

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
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "curation_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
