//! Prometheus exporter and backlog gauges.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use metrics::gauge;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use sluice_core::Clock;
use sluice_delivery::{
    telemetry::{
        describe_metrics, DLQ_TOTAL, FHIR_CALL_LATENCY_SECONDS, LATENCY_BUCKETS,
        OUTBOX_LAG_SECONDS, OUTBOX_UNPROCESSED_COUNT,
    },
    OutboxStorage,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Installs the global recorder and serves `/metrics` on `port`.
///
/// # Errors
///
/// Returns an error if the listener cannot bind or a recorder is already
/// installed.
pub fn install_exporter(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full(FHIR_CALL_LATENCY_SECONDS.to_string()),
            LATENCY_BUCKETS,
        )
        .context("Invalid latency buckets")?
        .install()
        .context("Failed to install Prometheus exporter")?;

    describe_metrics();
    info!(%addr, "metrics exporter listening");
    Ok(())
}

/// Values written to the backlog gauges on one refresh.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BacklogSnapshot {
    /// Age of the oldest claimable row.
    pub lag_seconds: f64,
    /// Unprocessed rows ready for delivery.
    pub unprocessed: i64,
    /// Rows in the dead-letter table.
    pub dead_letters: i64,
}

/// Reads backlog size, lag and dead-letter count and publishes them.
///
/// # Errors
///
/// Returns an error if either store query fails. Gauges keep their previous
/// values in that case.
pub async fn refresh_backlog_gauges(
    storage: &dyn OutboxStorage,
    clock: &dyn Clock,
) -> Result<BacklogSnapshot> {
    let backlog = storage.backlog_stats().await.context("Failed to read outbox backlog")?;
    let dead_letters =
        storage.dead_letter_count().await.context("Failed to count dead letters")?;

    let snapshot = BacklogSnapshot {
        lag_seconds: backlog.lag_seconds(clock.now_utc()),
        unprocessed: backlog.unprocessed,
        dead_letters,
    };

    gauge!(OUTBOX_LAG_SECONDS).set(snapshot.lag_seconds);
    gauge!(OUTBOX_UNPROCESSED_COUNT).set(snapshot.unprocessed as f64);
    gauge!(DLQ_TOTAL).set(snapshot.dead_letters as f64);
    Ok(snapshot)
}

/// Refreshes the backlog gauges every `interval` until cancelled.
pub fn spawn_gauge_refresher(
    storage: Arc<dyn OutboxStorage>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    cancellation_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match refresh_backlog_gauges(storage.as_ref(), clock.as_ref()).await {
                Ok(snapshot) => debug!(
                    lag_seconds = snapshot.lag_seconds,
                    unprocessed = snapshot.unprocessed,
                    dead_letters = snapshot.dead_letters,
                    "backlog gauges refreshed"
                ),
                Err(e) => warn!(error = %e, "backlog gauge refresh failed"),
            }

            tokio::select! {
                biased;
                () = cancellation_token.cancelled() => break,
                () = clock.sleep(interval) => {},
            }
        }
        debug!("gauge refresher stopped");
    })
}
