mod handlers;
mod routes;

use anyhow::Context;
use arbiter_common::{Config, Language};
use arbiter_judge::{metrics, provider_for, DirArtifactStore, JudgeService, Scheduler};
use axum::Router;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

const RETENTION_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Scheduler,
    pub artifacts: Arc<DirArtifactStore>,
    pub start_time: Arc<Instant>,
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new().merge(routes::routes()).with_state(state)
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Arbiter server booting...");

    metrics::init_metrics();
    info!("Metrics registry initialized");

    let config = Config::from_env();
    info!(
        backend = ?config.backend,
        max_workers = config.max_workers,
        problems_dir = %config.problems_dir.display(),
        "configuration loaded"
    );

    let provider = provider_for(config.backend).context("failed to set up isolation provider")?;
    let artifacts = Arc::new(DirArtifactStore::new(config.artifacts_dir.clone()));
    match artifacts.clear().await {
        Ok(0) => {}
        Ok(removed) => info!(removed, "stale artifacts removed"),
        Err(e) => warn!(error = %e, "could not clean artifact directory"),
    }

    let service = Arc::new(JudgeService::from_config(
        &config,
        provider,
        artifacts.clone(),
    ));
    service.pool().prewarm(Language::all_variants());
    service.pool().start_sweeper(config.pool_freshness);

    let scheduler = Scheduler::new(service, config.max_workers);

    let retention = {
        let scheduler = scheduler.clone();
        let keep = config.submission_retention;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RETENTION_INTERVAL);
            loop {
                ticker.tick().await;
                let removed = scheduler.retain_latest(keep);
                if removed > 0 {
                    debug!(removed, "old submissions pruned");
                }
            }
        })
    };

    let state = Arc::new(AppState {
        scheduler: scheduler.clone(),
        artifacts: artifacts.clone(),
        start_time: Arc::new(Instant::now()),
    });

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    retention.abort();
    scheduler.shutdown().await;
    if let Err(e) = artifacts.clear().await {
        warn!(error = %e, "could not clean artifact directory");
    }
    info!("Arbiter server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal, draining submissions...");
}
