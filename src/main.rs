//! Sluice outbox delivery worker.
//!
//! Main entry point for the worker. Loads configuration, connects to the
//! store, starts the delivery engine and metrics exporter, and coordinates
//! graceful shutdown.

#![forbid(unsafe_code)]

mod config;
mod telemetry;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use sluice_core::{storage::Storage, Clock, RealClock};
use sluice_delivery::{DeliveryEngine, PgChangeListener};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Configuration comes first so the log filter can fall back to it
    let config = Config::load()?;
    init_tracing(&config.rust_log)?;

    info!("Starting sluice outbox worker");
    info!(
        database_url = %config.database_url_masked(),
        fhir_server = %config.normalized_fhir_server(),
        worker_id = %config.worker_id,
        channel = %config.db_channel,
        poll_interval_ms = config.poll_interval_ms,
        burst_limit = config.effective_burst_limit(),
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    let storage = Arc::new(Storage::new(db_pool.clone()));
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());

    telemetry::install_exporter(config.metrics_port)?;

    let mut engine =
        DeliveryEngine::with_postgres(storage, config.to_delivery_config(), clock.clone())
            .context("Failed to build delivery engine")?;

    let gauges_token = CancellationToken::new();
    let gauges = telemetry::spawn_gauge_refresher(
        engine.storage(),
        clock,
        config.metrics_poll_interval(),
        gauges_token.clone(),
    );

    let listener = PgChangeListener::connect(&db_pool, &config.db_channel)
        .await
        .context("Failed to subscribe to outbox notifications")?;
    engine.start(Box::new(listener)).await;

    info!(worker_id = %config.worker_id, "Sluice is delivering outbox events");

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    let engine_result = engine.shutdown().await;
    if let Err(e) = &engine_result {
        error!(error = %e, "Delivery engine did not stop cleanly");
    }

    gauges_token.cancel();
    if let Err(e) = gauges.await {
        warn!(error = %e, "Gauge refresher panicked");
    }

    db_pool.close().await;
    info!("Database connections closed");

    engine_result.context("Delivery engine shutdown failed")?;
    info!("Sluice shutdown complete");
    Ok(())
}

/// Initializes tracing, preferring `RUST_LOG` directives from the environment.
fn init_tracing(fallback_filter: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback_filter))
        .context("Invalid log filter")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(())
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let url = config.connection_url()?;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&url)
            .await
        {
            Ok(pool) => {
                // Verify connection works
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
///
/// A handler that cannot be installed is logged and never fires, leaving the
/// other signal in charge.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
