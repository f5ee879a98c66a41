//! sapphire daemon: runs the embedding scheduler against the configured store.

use std::sync::Arc;
use std::time::Duration;

use sapphire_db::{log_pool_metrics, Database, ImageLifecycle, PoolConfig, Stores};
use sapphire_jobs::{
    defaults, EmbeddingScheduler, SchedulerConfig, SchedulerEvent, SimulatedEmbeddingBackend,
};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let _file_guard = init_tracing();

    let stores = match std::env::var("DATABASE_URL") {
        Ok(database_url) => {
            info!("Connecting to database...");
            let pool_config = PoolConfig::from_env();
            let db = Database::connect_with_config(&database_url, pool_config.clone()).await?;
            info!("Running database migrations...");
            db.migrate().await?;
            info!("Database ready");
            if let Some(period) = pool_config.metrics_interval {
                tokio::spawn(monitor_pool(db.clone(), period));
            }
            db.stores()
        }
        Err(_) => {
            warn!("DATABASE_URL not set, using in-memory store; state is lost on exit");
            Stores::memory()
        }
    };

    let lifecycle = ImageLifecycle::new(stores.images.clone());
    let latency_ms = std::env::var("EMBED_SIMULATED_LATENCY_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(defaults::EMBED_SIMULATED_LATENCY_MS);
    let backend = SimulatedEmbeddingBackend::new().with_latency_ms(latency_ms);

    let config = SchedulerConfig::from_env();
    if !config.enabled {
        info!("Embedding scheduler disabled (SCHEDULER_ENABLED=false), nothing to do");
        return Ok(());
    }

    let scheduler = EmbeddingScheduler::new(lifecycle, Arc::new(backend), config);
    let handle = scheduler.start();
    tokio::spawn(log_events(handle.events()));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping scheduler");
    handle.stop().await?;
    info!("Shutdown complete");
    Ok(())
}

/// Initialize tracing with configurable output.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, enables file logging)
///   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
///   RUST_LOG    - standard env filter (default: "sapphire=info")
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "sapphire=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let path = std::path::Path::new(path);
        let file_dir = path.parent().unwrap_or(std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("sapphire.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            // No ANSI in files unless asked for.
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );
    guard
}

/// Log pool health every `period` for the life of the process.
async fn monitor_pool(db: Database, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        log_pool_metrics(db.pool());
    }
}

/// Mirror scheduler events into the log until the scheduler stops.
async fn log_events(mut events: broadcast::Receiver<SchedulerEvent>) {
    loop {
        match events.recv().await {
            Ok(SchedulerEvent::BatchCompleted(report)) => info!(
                batch_id = %report.batch_id,
                embedded = report.embedded.len(),
                retried = report.retried.len(),
                abandoned = report.abandoned.len(),
                "Batch finished"
            ),
            Ok(SchedulerEvent::SchedulerStopped) => break,
            Ok(event) => debug!(?event, "Scheduler event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Scheduler event log lagged")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
