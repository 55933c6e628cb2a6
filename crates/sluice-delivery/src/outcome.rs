//! Settling a claimed group after a delivery attempt.
//!
//! Every claimed group leaves a cycle in exactly one state: processed with a
//! ledger entry, rescheduled for retry, or moved to the dead-letter table.
//! The resolver owns those transitions along with the counters that track
//! them.

use std::sync::Arc;

use metrics::counter;
use sluice_core::{OutboxEvent, OutboxId, ResourceRef};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::{
    engine::EngineStats,
    error::{DeliveryError, Result},
    merge::event_key,
    retry::{RetryDecision, RetryPolicy},
    storage::OutboxStorage,
    telemetry::{FAILED_TOTAL, PROCESSED_TOTAL},
};

/// Error text recorded when a group has nothing to address the write with.
pub const NO_IDENTIFIER_ERROR: &str = "No identifier available for conditional update";

/// Error text recorded when the group claim lost every row to another worker.
pub const EMPTY_GROUP_ERROR: &str = "Empty group after claim";

/// How a failed group was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureResolution {
    /// Rows stay in the outbox with a future `next_retry_at`.
    Retried,
    /// Rows were moved to the dead-letter table.
    DeadLettered,
}

/// Applies delivery results to the store.
#[derive(Clone)]
pub struct OutcomeResolver {
    storage: Arc<dyn OutboxStorage>,
    policy: RetryPolicy,
    stats: Arc<RwLock<EngineStats>>,
}

impl OutcomeResolver {
    /// Creates a resolver writing through `storage`.
    pub fn new(
        storage: Arc<dyn OutboxStorage>,
        policy: RetryPolicy,
        stats: Arc<RwLock<EngineStats>>,
    ) -> Self {
        Self { storage, policy, stats }
    }

    /// Marks every row delivered and appends the group's ledger entry.
    ///
    /// # Errors
    ///
    /// Returns a database error if the rows cannot be updated or the ledger
    /// insert is rejected, including a duplicate event key.
    pub async fn delivered(&self, rows: &[OutboxEvent], resource: &ResourceRef) -> Result<()> {
        let ids: Vec<OutboxId> = rows.iter().map(|row| row.id).collect();
        let updated = self.storage.mark_processed(&ids, resource).await?;

        if let Some(key) = event_key(rows) {
            self.storage.record_processed(&key).await.inspect_err(|e| {
                error!(event_key = %key, error = %e, "failed to record processed event");
            })?;
        }

        counter!(PROCESSED_TOTAL).increment(ids.len() as u64);
        {
            let mut stats = self.stats.write().await;
            stats.groups_delivered += 1;
            stats.events_processed += ids.len() as u64;
        }

        info!(
            txid = ?rows.first().map(|row| row.txid),
            count = ids.len(),
            updated,
            fhir_id = ?resource.id,
            fhir_version = ?resource.version,
            "group delivered"
        );
        Ok(())
    }

    /// Retries or dead-letters every row of a group after a failed call.
    ///
    /// # Errors
    ///
    /// Returns a database error if a row cannot be rescheduled or moved.
    pub async fn failed(
        &self,
        rows: &[OutboxEvent],
        failure: &DeliveryError,
    ) -> Result<FailureResolution> {
        error!(
            status = failure.status_code(),
            error = %failure,
            count = rows.len(),
            "delivery failed"
        );

        let mut resolution = FailureResolution::Retried;
        for row in rows {
            match self.policy.decide(failure, row.attempts) {
                RetryDecision::Retry { delay } => {
                    self.retry(row, delay, &failure.error_text()).await?;
                },
                RetryDecision::DeadLetter { reason } => {
                    self.dead_letter(row, &reason).await?;
                    resolution = FailureResolution::DeadLettered;
                },
            }
        }

        let txid = rows.first().map(|row| row.txid);
        match resolution {
            FailureResolution::Retried => warn!(txid = ?txid, "scheduled retry"),
            FailureResolution::DeadLettered => {
                error!(txid = ?txid, error = %failure.error_text(), "moved to dead-letter table");
            },
        }
        Ok(resolution)
    }

    /// Dead-letters a group that has neither an identifier nor a prior
    /// resource id. No delivery is attempted.
    ///
    /// # Errors
    ///
    /// Returns a database error if a row cannot be moved.
    pub async fn undeliverable(&self, rows: &[OutboxEvent]) -> Result<()> {
        warn!(
            txid = ?rows.first().map(|row| row.txid),
            count = rows.len(),
            "{NO_IDENTIFIER_ERROR}"
        );
        for row in rows {
            self.dead_letter(row, NO_IDENTIFIER_ERROR).await?;
        }
        Ok(())
    }

    /// Reschedules the anchor row when its group claim came back empty.
    ///
    /// # Errors
    ///
    /// Returns a database error if the row cannot be rescheduled.
    pub async fn race_lost(&self, anchor: &OutboxEvent) -> Result<()> {
        warn!(outbox_id = %anchor.id, txid = %anchor.txid, "{EMPTY_GROUP_ERROR}");
        self.retry(anchor, self.policy.delay_for(anchor.attempts), EMPTY_GROUP_ERROR).await?;
        self.stats.write().await.race_losses += 1;
        Ok(())
    }

    async fn retry(
        &self,
        row: &OutboxEvent,
        delay: std::time::Duration,
        error_text: &str,
    ) -> Result<()> {
        self.storage.schedule_retry(row.id, delay, error_text).await?;
        counter!(FAILED_TOTAL, "outcome" => "retry").increment(1);
        self.stats.write().await.events_retried += 1;
        debug!(
            outbox_id = %row.id,
            attempts = row.attempts + 1,
            delay_secs = delay.as_secs(),
            "row rescheduled"
        );
        Ok(())
    }

    async fn dead_letter(&self, row: &OutboxEvent, error_text: &str) -> Result<()> {
        if !self.storage.move_to_dead_letter(row.id, error_text).await? {
            debug!(outbox_id = %row.id, "row already gone, nothing to dead-letter");
            return Ok(());
        }
        counter!(FAILED_TOTAL, "outcome" => "dead_letter").increment(1);
        self.stats.write().await.events_dead_lettered += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use sluice_core::{Clock, TestClock};

    use super::*;
    use crate::storage::mock::{MockOutboxStorage, NewOutboxRow};

    struct Harness {
        clock: TestClock,
        storage: MockOutboxStorage,
        stats: Arc<RwLock<EngineStats>>,
        resolver: OutcomeResolver,
    }

    fn harness() -> Harness {
        let clock = TestClock::new();
        let storage = MockOutboxStorage::new(Arc::new(clock.clone()));
        let stats = Arc::new(RwLock::new(EngineStats::default()));
        let resolver =
            OutcomeResolver::new(Arc::new(storage.clone()), RetryPolicy::default(), stats.clone());
        Harness { clock, storage, stats, resolver }
    }

    async fn rows(storage: &MockOutboxStorage) -> Vec<OutboxEvent> {
        storage.insert(NewOutboxRow::new(100, json!({"a": 1})).patient(7).source("patients", 42)).await;
        storage.insert(NewOutboxRow::new(100, json!({"b": 2})).patient(7).source("addresses", 9)).await;
        storage.events().await
    }

    #[tokio::test]
    async fn delivered_marks_rows_and_writes_one_ledger_entry() {
        let h = harness();
        let group = rows(&h.storage).await;
        let resource = ResourceRef { id: Some("pat-9".into()), version: Some("3".into()) };

        h.resolver.delivered(&group, &resource).await.unwrap();

        for row in h.storage.events().await {
            assert!(row.processed);
            assert_eq!(row.processed_at, Some(h.clock.now_utc()));
            assert_eq!(row.fhir_resource_id.as_deref(), Some("pat-9"));
            assert_eq!(row.fhir_version.as_deref(), Some("3"));
            assert_eq!(row.locked_by, None);
        }
        assert_eq!(h.storage.ledger().await, vec!["patients|42|100".to_string()]);
        assert!(h.storage.dead_letters().await.is_empty());

        let stats = h.stats.read().await;
        assert_eq!(stats.groups_delivered, 1);
        assert_eq!(stats.events_processed, 2);
    }

    #[tokio::test]
    async fn duplicate_ledger_key_fails_loudly() {
        let h = harness();
        let group = rows(&h.storage).await;
        h.resolver.delivered(&group, &ResourceRef::default()).await.unwrap();

        let err = h.resolver.delivered(&group, &ResourceRef::default()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::DatabaseError { .. }));
        assert_eq!(h.storage.ledger().await.len(), 1);
    }

    #[tokio::test]
    async fn retryable_failure_reschedules_every_row() {
        let h = harness();
        let group = rows(&h.storage).await;

        let resolution = h
            .resolver
            .failed(&group, &DeliveryError::from_status(503, "try later"))
            .await
            .unwrap();

        assert_eq!(resolution, FailureResolution::Retried);
        let expected_retry = h.clock.now_utc() + chrono::Duration::seconds(60);
        for row in h.storage.events().await {
            assert_eq!(row.attempts, 1);
            assert_eq!(row.last_error.as_deref(), Some("try later"));
            assert_eq!(row.next_retry_at, Some(expected_retry));
            assert!(!row.processed);
        }
        assert_eq!(h.stats.read().await.events_retried, 2);
    }

    #[tokio::test]
    async fn backoff_scales_with_prior_attempts() {
        let h = harness();
        let group = rows(&h.storage).await;
        let failure = DeliveryError::network("connection refused");

        h.resolver.failed(&group, &failure).await.unwrap();
        h.clock.advance(Duration::from_secs(60));
        let group = h.storage.events().await;
        h.resolver.failed(&group, &failure).await.unwrap();
        h.clock.advance(Duration::from_secs(60));
        let group = h.storage.events().await;
        h.resolver.failed(&group, &failure).await.unwrap();

        let row = &h.storage.events().await[0];
        assert_eq!(row.attempts, 3);
        assert_eq!(row.next_retry_at, Some(h.clock.now_utc() + chrono::Duration::seconds(120)));
        assert_eq!(
            row.last_error.as_deref(),
            Some("network connection failed: connection refused")
        );
    }

    #[tokio::test]
    async fn terminal_failure_dead_letters_every_row() {
        let h = harness();
        let group = rows(&h.storage).await;

        let resolution = h
            .resolver
            .failed(&group, &DeliveryError::from_status(422, r#"{"issue":[]}"#))
            .await
            .unwrap();

        assert_eq!(resolution, FailureResolution::DeadLettered);
        assert!(h.storage.events().await.is_empty());
        let dead = h.storage.dead_letters().await;
        assert_eq!(dead.len(), 2);
        assert!(dead.iter().all(|entry| entry.error_text == r#"{"issue":[]}"#));
        assert_eq!(dead[0].outbox_id, group[0].id);
        assert_eq!(dead[0].payload_json, json!({"a": 1}));
        assert!(h.storage.ledger().await.is_empty());
    }

    #[tokio::test]
    async fn undeliverable_group_is_dead_lettered_with_reason() {
        let h = harness();
        let group = rows(&h.storage).await;

        h.resolver.undeliverable(&group).await.unwrap();

        let dead = h.storage.dead_letters().await;
        assert_eq!(dead.len(), 2);
        assert!(dead.iter().all(|entry| entry.error_text == NO_IDENTIFIER_ERROR));
        assert_eq!(h.stats.read().await.events_dead_lettered, 2);
    }

    #[tokio::test]
    async fn race_loss_reschedules_anchor_only() {
        let h = harness();
        let group = rows(&h.storage).await;

        h.resolver.race_lost(&group[0]).await.unwrap();

        let events = h.storage.events().await;
        assert_eq!(events[0].attempts, 1);
        assert_eq!(events[0].last_error.as_deref(), Some(EMPTY_GROUP_ERROR));
        assert_eq!(events[1].attempts, 0);
        assert_eq!(h.stats.read().await.race_losses, 1);
    }
}
