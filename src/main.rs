//! healthtrail - API health monitoring.
//!
//! Probes configured HTTP health endpoints on a schedule, records every
//! result, and periodically writes digests with latency, error-rate and
//! anomaly figures.

mod analysis;
mod clock;
mod config;
mod db;
mod probe;
mod scheduler;
mod web;

#[cfg(test)]
mod testing;

use analysis::{Analyzer, ExternalSummarizer};
use clock::SystemClock;
use config::ServerConfig;
use db::Store;
use probe::{HttpProber, ProbeLog};
use scheduler::{Job, ProbeEngine, Scheduler};
use web::Server;

use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("healthtrail=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting healthtrail on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let services_json = Path::new(&cfg.services_json);
    if services_json.exists() {
        let created = db::seed_services(&store, services_json)?;
        tracing::info!("Seeded {} new services from {}", created, cfg.services_json);
    }

    let clock = Arc::new(SystemClock::new());
    let (probe_log, log_writer) = ProbeLog::spawn_file_writer(&cfg.health_log_path);

    let engine = ProbeEngine::new(
        store.clone(),
        store.clone(),
        Arc::new(HttpProber::new()?),
        clock.clone(),
        probe_log,
    )
    .with_max_concurrent(cfg.max_concurrent_probes);

    let mut analyzer = Analyzer::new(store.clone(), store.clone(), clock.clone());
    if let Some(key) = &cfg.external_api_key {
        let summarizer =
            ExternalSummarizer::new(&cfg.external_api_url, key.clone(), cfg.external_model.clone())?;
        analyzer = analyzer.with_summarizer(Arc::new(summarizer));
        tracing::info!("External summarizer enabled ({})", cfg.external_model);
    }

    // A bad expression only disables its own job.
    let mut scheduler = Scheduler::new(clock.clone());
    if let Err(e) = scheduler.add_job(&cfg.probe_cron, Job::ProbeSweep(engine)) {
        tracing::error!("Probe sweeps disabled: {}", e);
    }
    let analysis = Job::Analysis {
        analyzer,
        window_hours: cfg.analysis_window_hours,
    };
    if let Err(e) = scheduler.add_job(&cfg.analysis_cron, analysis) {
        tracing::error!("Analysis disabled: {}", e);
    }
    scheduler.start().await;

    // Start web server
    let server = Server::new(cfg.http_port, store, clock);
    let served = server.start(shutdown_signal()).await;

    scheduler.stop().await;
    // The scheduler owned the last probe log handles; wait for the final flush.
    drop(scheduler);
    if let Err(e) = log_writer.await {
        tracing::error!("Probe log writer failed: {}", e);
    }

    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
