//! Scheduling of delivery cycles.
//!
//! Two trigger tasks feed one drain task. The notification task turns each
//! store notification into a burst request and the poll task turns each
//! tick into a single-cycle request. Only the drain task runs cycles, so
//! claims within one process are strictly sequential and two cycles never
//! hold leases under the same worker identity at once. Across processes the
//! store's conditional claim keeps workers from delivering the same row.
//! Cancellation is observed while a task waits and between the cycles of a
//! burst, never inside a cycle, so a group that has been claimed always
//! settles before the engine stops.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use sluice_core::{storage::Storage, Clock, LEASE_DURATION};
use tokio::{
    sync::{mpsc, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    claim::ClaimCoordinator,
    client::{ClientConfig, DeliveryGateway, FhirClient},
    error::{DeliveryError, Result},
    listener::ChangeNotifications,
    outcome::OutcomeResolver,
    retry::RetryPolicy,
    storage::{OutboxStorage, PostgresOutboxStorage},
    worker::{CycleOutcome, OutboxWorker},
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Identity written into `locked_by`.
    pub worker_id: String,

    /// Interval between poll ticks.
    pub poll_interval: Duration,

    /// Maximum cycles drained per notification.
    pub burst_limit: usize,

    /// Pause after a cycle fails with a store error.
    pub error_pause: Duration,

    /// Lease granted on claim.
    pub lease: Duration,

    /// Maximum time to wait for tasks to stop.
    pub shutdown_timeout: Duration,

    /// Notification channel name.
    pub channel: String,

    /// Backoff applied to failed rows.
    pub retry_policy: RetryPolicy,

    /// FHIR client settings.
    pub client_config: ClientConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-0".to_string(),
            poll_interval: Duration::from_millis(crate::DEFAULT_POLL_INTERVAL_MS),
            burst_limit: crate::DEFAULT_BURST_LIMIT,
            error_pause: Duration::from_millis(200),
            lease: LEASE_DURATION,
            shutdown_timeout: Duration::from_secs(30),
            channel: crate::DEFAULT_CHANNEL.to_string(),
            retry_policy: RetryPolicy::default(),
            client_config: ClientConfig::default(),
        }
    }
}

impl DeliveryConfig {
    /// Checks settings the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.worker_id.trim().is_empty() {
            return Err(DeliveryError::configuration("worker id must not be empty"));
        }
        if self.poll_interval.is_zero() {
            return Err(DeliveryError::configuration("poll interval must be positive"));
        }
        if self.burst_limit == 0 {
            return Err(DeliveryError::configuration("burst limit must be positive"));
        }
        if self.client_config.timeout >= self.lease {
            return Err(DeliveryError::configuration(format!(
                "delivery timeout {}ms must be shorter than the {}s lease",
                self.client_config.timeout.as_millis(),
                self.lease.as_secs()
            )));
        }
        Ok(())
    }
}

/// Statistics for delivery engine monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Scheduling tasks currently running.
    pub active_tasks: usize,
    /// Notifications received.
    pub notifications_received: u64,
    /// Cycles that completed without a store error.
    pub cycles_completed: u64,
    /// Cycles that failed with a store error.
    pub cycle_errors: u64,
    /// Groups delivered.
    pub groups_delivered: u64,
    /// Rows marked processed.
    pub events_processed: u64,
    /// Rows rescheduled for retry.
    pub events_retried: u64,
    /// Rows moved to the dead-letter table.
    pub events_dead_lettered: u64,
    /// Group claims that came back empty.
    pub race_losses: u64,
}

/// Cycle runner owned by the drain task.
#[derive(Clone)]
struct Scheduler {
    worker: OutboxWorker,
    clock: Arc<dyn Clock>,
    stats: Arc<RwLock<EngineStats>>,
    burst_limit: usize,
    error_pause: Duration,
    cancellation_token: CancellationToken,
}

impl Scheduler {
    async fn cycle(&self) -> Option<CycleOutcome> {
        match self.worker.process_claimed().await {
            Ok(outcome) => {
                self.stats.write().await.cycles_completed += 1;
                Some(outcome)
            },
            Err(error) => {
                error!(
                    worker_id = %self.worker.worker_id(),
                    error = %error,
                    "delivery cycle failed"
                );
                self.stats.write().await.cycle_errors += 1;
                None
            },
        }
    }

    async fn drain_burst(&self) -> usize {
        let mut settled = 0;
        for _ in 0..self.burst_limit {
            if self.cancellation_token.is_cancelled() {
                break;
            }
            match self.cycle().await {
                Some(outcome) if outcome.did_work() => settled += 1,
                Some(outcome) => {
                    debug!(?outcome, "burst ended");
                    break;
                },
                None => self.clock.sleep(self.error_pause).await,
            }
        }
        settled
    }
}

/// Delivery engine coordinating the notification and poll tasks.
pub struct DeliveryEngine {
    config: DeliveryConfig,
    scheduler: Scheduler,
    storage: Arc<dyn OutboxStorage>,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl DeliveryEngine {
    /// Creates an engine from explicit store, gateway and clock.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` fails validation.
    pub fn new(
        storage: Arc<dyn OutboxStorage>,
        gateway: Arc<dyn DeliveryGateway>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let stats = Arc::new(RwLock::new(EngineStats::default()));
        let claims =
            ClaimCoordinator::with_lease(storage.clone(), config.worker_id.clone(), config.lease);
        let resolver =
            OutcomeResolver::new(storage.clone(), config.retry_policy.clone(), stats.clone());
        let worker = OutboxWorker::new(claims, gateway, resolver);
        let cancellation_token = CancellationToken::new();
        let scheduler = Scheduler {
            worker,
            clock,
            stats: stats.clone(),
            burst_limit: config.burst_limit,
            error_pause: config.error_pause,
            cancellation_token: cancellation_token.clone(),
        };

        Ok(Self { config, scheduler, storage, stats, cancellation_token, tasks: Vec::new() })
    }

    /// Creates a production engine over PostgreSQL and the FHIR HTTP client.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the client cannot
    /// be built.
    pub fn with_postgres(
        storage: Arc<Storage>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let gateway = Arc::new(FhirClient::new(config.client_config.clone())?);
        let storage = Arc::new(PostgresOutboxStorage::new(storage));
        Self::new(storage, gateway, config, clock)
    }

    /// Store handle used by the engine.
    pub fn storage(&self) -> Arc<dyn OutboxStorage> {
        self.storage.clone()
    }

    /// Token cancelled when the engine shuts down.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Runs one cycle directly, outside the scheduling tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if a store operation fails.
    pub async fn process_claimed(&self) -> Result<CycleOutcome> {
        self.scheduler.worker.process_claimed().await
    }

    /// Drains one burst and returns how many cycles removed rows from the
    /// backlog.
    pub async fn drain_burst(&self) -> usize {
        self.scheduler.drain_burst().await
    }

    /// Spawns the notification, poll and drain tasks and returns
    /// immediately.
    pub async fn start(&mut self, notifications: Box<dyn ChangeNotifications>) {
        info!(
            worker_id = %self.config.worker_id,
            channel = %self.config.channel,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            burst_limit = self.config.burst_limit,
            "starting outbox delivery engine"
        );

        let (wake_tx, wake_rx) = mpsc::channel(WAKE_QUEUE_DEPTH);
        let drain_task = tokio::spawn(run_drain(
            self.scheduler.clone(),
            wake_rx,
            self.cancellation_token.clone(),
        ));
        let notify_task = tokio::spawn(run_notifications(
            notifications,
            wake_tx.clone(),
            self.stats.clone(),
            self.scheduler.clock.clone(),
            self.config.error_pause,
            self.cancellation_token.clone(),
        ));
        let poll_task = tokio::spawn(run_poll(
            wake_tx,
            self.scheduler.clock.clone(),
            self.config.poll_interval,
            self.cancellation_token.clone(),
        ));
        self.tasks.push(("notification", notify_task));
        self.tasks.push(("poll", poll_task));
        self.tasks.push(("drain", drain_task));
        self.stats.write().await.active_tasks = self.tasks.len();

        info!(worker_id = %self.config.worker_id, "delivery engine started");
    }

    /// Stops all tasks, letting any in-flight cycle settle first.
    ///
    /// # Errors
    ///
    /// Returns an error if the tasks do not stop within the shutdown timeout
    /// or one of them panicked.
    pub async fn shutdown(mut self) -> Result<()> {
        let timeout = self.config.shutdown_timeout;
        info!(
            task_count = self.tasks.len(),
            timeout_seconds = timeout.as_secs(),
            "shutting down delivery engine"
        );

        self.cancellation_token.cancel();

        let tasks = std::mem::take(&mut self.tasks);
        let join_all = async {
            let mut first_panic = None;
            for (task, handle) in tasks {
                if let Err(join_error) = handle.await {
                    error!(task, error = %join_error, "scheduling task panicked");
                    if first_panic.is_none() {
                        first_panic =
                            Some(DeliveryError::WorkerPanic { task, error: join_error.to_string() });
                    }
                }
            }
            first_panic
        };

        let result = match tokio::time::timeout(timeout, join_all).await {
            Ok(None) => Ok(()),
            Ok(Some(panic)) => Err(panic),
            Err(_elapsed) => {
                error!(timeout_seconds = timeout.as_secs(), "delivery engine shutdown timed out");
                Err(DeliveryError::ShutdownTimeout { timeout_seconds: timeout.as_secs() })
            },
        };

        self.stats.write().await.active_tasks = 0;
        if result.is_ok() {
            info!("delivery engine stopped");
        }
        result
    }

    /// Returns current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }
}

/// Pending wake requests; further requests coalesce while the queue is full.
const WAKE_QUEUE_DEPTH: usize = 8;

/// Work requested from the drain task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    /// Drain a bounded burst.
    Burst,
    /// Run one cycle.
    Tick,
}

fn request(wake_tx: &mpsc::Sender<Wake>, wake: Wake) {
    if let Err(mpsc::error::TrySendError::Full(_)) = wake_tx.try_send(wake) {
        debug!(?wake, "drain already has pending work, coalescing");
    }
}

async fn run_drain(
    scheduler: Scheduler,
    mut wake_rx: mpsc::Receiver<Wake>,
    cancellation_token: CancellationToken,
) {
    loop {
        let wake = tokio::select! {
            biased;
            () = cancellation_token.cancelled() => break,
            wake = wake_rx.recv() => match wake {
                Some(wake) => wake,
                None => break,
            },
        };

        match wake {
            Wake::Burst => {
                let settled = scheduler.drain_burst().await;
                debug!(settled, "burst drained");
            },
            Wake::Tick => {
                if let Some(outcome) = scheduler.cycle().await {
                    debug!(?outcome, "poll cycle finished");
                }
            },
        }
    }
    info!("drain task stopped");
}

async fn run_notifications(
    mut notifications: Box<dyn ChangeNotifications>,
    wake_tx: mpsc::Sender<Wake>,
    stats: Arc<RwLock<EngineStats>>,
    clock: Arc<dyn Clock>,
    error_pause: Duration,
    cancellation_token: CancellationToken,
) {
    loop {
        let signal = tokio::select! {
            () = cancellation_token.cancelled() => break,
            signal = notifications.recv() => signal,
        };

        match signal {
            Ok(Some(payload)) => {
                debug!(payload = %payload, "outbox notification");
                stats.write().await.notifications_received += 1;
                request(&wake_tx, Wake::Burst);
            },
            Ok(None) => {
                warn!("notification source closed, continuing on polling only");
                break;
            },
            Err(e) => {
                warn!(error = %e, "failed to receive notification");
                tokio::select! {
                    () = clock.sleep(error_pause) => {},
                    () = cancellation_token.cancelled() => break,
                }
            },
        }
    }

    notifications.close().await;
    info!("notification task stopped");
}

async fn run_poll(
    wake_tx: mpsc::Sender<Wake>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    cancellation_token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = clock.sleep(interval) => {},
            () = cancellation_token.cancelled() => break,
        }
        request(&wake_tx, Wake::Tick);
    }
    info!("poll task stopped");
}
