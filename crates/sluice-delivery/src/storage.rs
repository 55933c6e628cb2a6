//! Storage seam between the delivery engine and the outbox tables.
//!
//! [`OutboxStorage`] lists exactly the store operations the claim, outcome
//! and scheduling code needs. [`PostgresOutboxStorage`] forwards to the
//! `sluice_core` repositories; [`mock::MockOutboxStorage`] keeps rows in
//! memory and applies the same eligibility and lease rules against a
//! [`Clock`](sluice_core::Clock), so engine behavior can be tested without a
//! database.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use sluice_core::{
    error::Result, storage::Storage, BacklogStats, OutboxEvent, OutboxId, PatientId, ResourceRef,
    TxId,
};

/// Store operations used by the delivery engine.
pub trait OutboxStorage: Send + Sync + 'static {
    /// Leases the oldest claimable row to `worker_id` for `lease`.
    fn claim_one<'a>(
        &'a self,
        worker_id: &'a str,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<OutboxEvent>>> + Send + 'a>>;

    /// Leases every claimable row of a group plus the `anchor` row that
    /// `worker_id` already holds. Other rows leased by `worker_id` are left
    /// alone.
    fn claim_group<'a>(
        &'a self,
        worker_id: &'a str,
        anchor: OutboxId,
        txid: TxId,
        patient_id: Option<PatientId>,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEvent>>> + Send + 'a>>;

    /// Reads the unprocessed rows of a group currently leased by `worker_id`.
    fn find_leased_group<'a>(
        &'a self,
        worker_id: &'a str,
        txid: TxId,
        patient_id: Option<PatientId>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEvent>>> + Send + 'a>>;

    /// Marks rows delivered with the downstream reference and clears leases.
    fn mark_processed<'a>(
        &'a self,
        ids: &'a [OutboxId],
        resource: &'a ResourceRef,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + 'a>>;

    /// Appends an idempotency ledger entry. Fails on a duplicate key.
    fn record_processed<'a>(
        &'a self,
        event_key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Counts a failed attempt, stores the error and delays the next claim.
    fn schedule_retry<'a>(
        &'a self,
        id: OutboxId,
        delay: Duration,
        error_text: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Copies a row to the dead-letter table and removes it from the outbox.
    fn move_to_dead_letter<'a>(
        &'a self,
        id: OutboxId,
        error_text: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>>;

    /// Backlog size and age for gauges.
    fn backlog_stats(&self) -> Pin<Box<dyn Future<Output = Result<BacklogStats>> + Send + '_>>;

    /// Number of dead-lettered rows.
    fn dead_letter_count(&self) -> Pin<Box<dyn Future<Output = Result<i64>> + Send + '_>>;
}

/// PostgreSQL-backed storage.
#[derive(Clone)]
pub struct PostgresOutboxStorage {
    storage: Arc<Storage>,
}

impl PostgresOutboxStorage {
    /// Wraps the shared repository handle.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl OutboxStorage for PostgresOutboxStorage {
    fn claim_one<'a>(
        &'a self,
        worker_id: &'a str,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<OutboxEvent>>> + Send + 'a>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.outbox_events.claim_one(worker_id, lease).await })
    }

    fn claim_group<'a>(
        &'a self,
        worker_id: &'a str,
        anchor: OutboxId,
        txid: TxId,
        patient_id: Option<PatientId>,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEvent>>> + Send + 'a>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.outbox_events.claim_group(worker_id, anchor, txid, patient_id, lease).await
        })
    }

    fn find_leased_group<'a>(
        &'a self,
        worker_id: &'a str,
        txid: TxId,
        patient_id: Option<PatientId>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEvent>>> + Send + 'a>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.outbox_events.find_leased_group(worker_id, txid, patient_id).await
        })
    }

    fn mark_processed<'a>(
        &'a self,
        ids: &'a [OutboxId],
        resource: &'a ResourceRef,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + 'a>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.outbox_events.mark_processed(ids, resource).await })
    }

    fn record_processed<'a>(
        &'a self,
        event_key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.processed_events.record(event_key).await })
    }

    fn schedule_retry<'a>(
        &'a self,
        id: OutboxId,
        delay: Duration,
        error_text: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.outbox_events.schedule_retry(id, delay, error_text).await })
    }

    fn move_to_dead_letter<'a>(
        &'a self,
        id: OutboxId,
        error_text: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.dead_letter(id, error_text).await })
    }

    fn backlog_stats(&self) -> Pin<Box<dyn Future<Output = Result<BacklogStats>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.outbox_events.backlog_stats().await })
    }

    fn dead_letter_count(&self) -> Pin<Box<dyn Future<Output = Result<i64>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.dead_letters.count().await })
    }
}

pub mod mock {
    //! In-memory outbox for tests.
    //!
    //! Rows live in a map keyed by id. Claims evaluate the same eligibility
    //! predicate as the SQL (processed flag, retry time, lease expiry) using
    //! the injected clock, so tests can expire leases and retry windows by
    //! advancing a [`TestClock`](sluice_core::TestClock).

    use std::{
        collections::{BTreeMap, HashSet},
        future::Future,
        pin::Pin,
        sync::Arc,
        time::Duration,
    };

    use chrono::{DateTime, Utc};
    use serde_json::Value;
    use sluice_core::{
        error::{CoreError, Result},
        BacklogStats, Clock, DeadLetterEntry, GroupKey, Operation, OutboxEvent, OutboxId,
        PatientId, ResourceRef, TxId,
    };
    use tokio::sync::RwLock;

    use super::OutboxStorage;

    /// Builder for rows inserted into the mock, standing in for the trigger.
    #[derive(Debug, Clone)]
    pub struct NewOutboxRow {
        txid: TxId,
        patient_id: Option<PatientId>,
        table_name: String,
        record_id: i32,
        operation: Operation,
        payload: Value,
        identifier: Option<(String, String)>,
        fhir_resource_id: Option<String>,
    }

    impl NewOutboxRow {
        /// Row for transaction `txid` with the given payload fragment.
        pub fn new(txid: i64, payload: Value) -> Self {
            Self {
                txid: TxId(txid),
                patient_id: None,
                table_name: "patients".to_string(),
                record_id: 1,
                operation: Operation::Insert,
                payload,
                identifier: None,
                fhir_resource_id: None,
            }
        }

        /// Sets the patient correlation id.
        pub fn patient(mut self, patient_id: i32) -> Self {
            self.patient_id = Some(PatientId(patient_id));
            self
        }

        /// Sets the source table and row key.
        pub fn source(mut self, table_name: &str, record_id: i32) -> Self {
            self.table_name = table_name.to_string();
            self.record_id = record_id;
            self
        }

        /// Sets the change kind.
        pub fn operation(mut self, operation: Operation) -> Self {
            self.operation = operation;
            self
        }

        /// Sets the identifier columns.
        pub fn identifier(mut self, system: &str, value: &str) -> Self {
            self.identifier = Some((system.to_string(), value.to_string()));
            self
        }

        /// Sets a previously recorded downstream resource id.
        pub fn resource_id(mut self, resource_id: &str) -> Self {
            self.fhir_resource_id = Some(resource_id.to_string());
            self
        }
    }

    #[derive(Default)]
    struct State {
        rows: BTreeMap<OutboxId, OutboxEvent>,
        dead_letters: Vec<DeadLetterEntry>,
        ledger: Vec<String>,
        ledger_keys: HashSet<String>,
        next_id: i64,
        claim_error: Option<String>,
        group_claim_error: Option<String>,
        steal_group_claim: bool,
    }

    /// In-memory outbox, dead-letter table and ledger.
    #[derive(Clone)]
    pub struct MockOutboxStorage {
        state: Arc<RwLock<State>>,
        clock: Arc<dyn Clock>,
    }

    impl MockOutboxStorage {
        /// Creates an empty store reading time from `clock`.
        pub fn new(clock: Arc<dyn Clock>) -> Self {
            Self { state: Arc::new(RwLock::new(State::default())), clock }
        }

        fn now(&self) -> DateTime<Utc> {
            self.clock.now_utc()
        }

        /// Inserts a row as the trigger would and returns its id.
        pub async fn insert(&self, row: NewOutboxRow) -> OutboxId {
            let now = self.now();
            let mut state = self.state.write().await;
            state.next_id += 1;
            let id = OutboxId(state.next_id);
            let sequence_in_tx = i32::try_from(
                state.rows.values().filter(|existing| existing.txid == row.txid).count() + 1,
            )
            .unwrap_or(i32::MAX);
            let (identifier_system, identifier_value) = row.identifier.unzip();

            state.rows.insert(id, OutboxEvent {
                id,
                txid: row.txid,
                sequence_in_tx,
                table_name: row.table_name,
                record_id: row.record_id,
                operation: row.operation,
                payload_json: row.payload,
                patient_id: row.patient_id,
                identifier_system,
                identifier_value,
                created_at: now,
                processed: false,
                processed_at: None,
                attempts: 0,
                next_retry_at: None,
                locked_by: None,
                lock_expires_at: None,
                fhir_resource_id: row.fhir_resource_id,
                fhir_version: None,
                last_error: None,
            });
            id
        }

        /// Current state of a row, `None` once dead-lettered.
        pub async fn event(&self, id: OutboxId) -> Option<OutboxEvent> {
            self.state.read().await.rows.get(&id).cloned()
        }

        /// All rows still in the outbox, by id.
        pub async fn events(&self) -> Vec<OutboxEvent> {
            self.state.read().await.rows.values().cloned().collect()
        }

        /// Dead-letter entries in creation order.
        pub async fn dead_letters(&self) -> Vec<DeadLetterEntry> {
            self.state.read().await.dead_letters.clone()
        }

        /// Ledger keys in insertion order.
        pub async fn ledger(&self) -> Vec<String> {
            self.state.read().await.ledger.clone()
        }

        /// Leases a row directly, as another worker would.
        pub async fn lease_to(&self, id: OutboxId, worker_id: &str, lease: Duration) {
            let expires = self.now() + to_chrono(lease);
            if let Some(row) = self.state.write().await.rows.get_mut(&id) {
                row.locked_by = Some(worker_id.to_string());
                row.lock_expires_at = Some(expires);
            }
        }

        /// Marks a row processed behind the engine's back.
        pub async fn force_processed(&self, id: OutboxId) {
            if let Some(row) = self.state.write().await.rows.get_mut(&id) {
                row.processed = true;
            }
        }

        /// Fails the next `claim_one` with a database error.
        pub async fn inject_claim_error(&self, error: impl Into<String>) {
            self.state.write().await.claim_error = Some(error.into());
        }

        /// Fails the next `claim_group` with a database error.
        pub async fn inject_group_claim_error(&self, error: impl Into<String>) {
            self.state.write().await.group_claim_error = Some(error.into());
        }

        /// Makes the next group claim lose the race for every row.
        ///
        /// The rows leased by the claimer are handed to another worker
        /// before the group update runs.
        pub async fn steal_next_group_claim(&self) {
            self.state.write().await.steal_group_claim = true;
        }
    }

    fn to_chrono(duration: Duration) -> chrono::Duration {
        chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
    }

    impl OutboxStorage for MockOutboxStorage {
        fn claim_one<'a>(
            &'a self,
            worker_id: &'a str,
            lease: Duration,
        ) -> Pin<Box<dyn Future<Output = Result<Option<OutboxEvent>>> + Send + 'a>> {
            Box::pin(async move {
                let now = self.now();
                let mut state = self.state.write().await;
                if let Some(error) = state.claim_error.take() {
                    return Err(CoreError::Database(error));
                }

                let candidate = state
                    .rows
                    .values()
                    .filter(|row| row.is_claimable(now))
                    .min_by_key(|row| (row.created_at, row.id))
                    .map(|row| row.id);

                Ok(candidate.and_then(|id| {
                    state.rows.get_mut(&id).map(|row| {
                        row.locked_by = Some(worker_id.to_string());
                        row.lock_expires_at = Some(now + to_chrono(lease));
                        row.clone()
                    })
                }))
            })
        }

        fn claim_group<'a>(
            &'a self,
            worker_id: &'a str,
            anchor: OutboxId,
            txid: TxId,
            patient_id: Option<PatientId>,
            lease: Duration,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEvent>>> + Send + 'a>> {
            Box::pin(async move {
                let now = self.now();
                let key = GroupKey { txid, patient_id };
                let mut state = self.state.write().await;
                if let Some(error) = state.group_claim_error.take() {
                    return Err(CoreError::Database(error));
                }

                if std::mem::take(&mut state.steal_group_claim) {
                    for row in state.rows.values_mut().filter(|row| key.matches(row)) {
                        row.locked_by = Some("rival-worker".to_string());
                        row.lock_expires_at = Some(now + to_chrono(lease));
                    }
                }

                let claimed: Vec<OutboxEvent> = state
                    .rows
                    .values_mut()
                    .filter(|row| {
                        key.matches(row)
                            && !row.processed
                            && row.is_retry_ready(now)
                            && (row.is_unleased(now)
                                || (row.id == anchor && row.is_leased_by(worker_id)))
                    })
                    .map(|row| {
                        row.locked_by = Some(worker_id.to_string());
                        row.lock_expires_at = Some(now + to_chrono(lease));
                        row.clone()
                    })
                    .collect();
                Ok(claimed)
            })
        }

        fn find_leased_group<'a>(
            &'a self,
            worker_id: &'a str,
            txid: TxId,
            patient_id: Option<PatientId>,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEvent>>> + Send + 'a>> {
            Box::pin(async move {
                let key = GroupKey { txid, patient_id };
                let state = self.state.read().await;
                Ok(state
                    .rows
                    .values()
                    .filter(|row| key.matches(row) && !row.processed && row.is_leased_by(worker_id))
                    .cloned()
                    .collect())
            })
        }

        fn mark_processed<'a>(
            &'a self,
            ids: &'a [OutboxId],
            resource: &'a ResourceRef,
        ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + 'a>> {
            Box::pin(async move {
                let now = self.now();
                let mut state = self.state.write().await;
                let mut updated = 0;
                for id in ids {
                    if let Some(row) = state.rows.get_mut(id) {
                        row.processed = true;
                        row.processed_at = Some(now);
                        row.fhir_resource_id = resource.id.clone();
                        row.fhir_version = resource.version.clone();
                        row.locked_by = None;
                        row.lock_expires_at = None;
                        updated += 1;
                    }
                }
                Ok(updated)
            })
        }

        fn record_processed<'a>(
            &'a self,
            event_key: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                if !state.ledger_keys.insert(event_key.to_string()) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "duplicate event_key {event_key}"
                    )));
                }
                state.ledger.push(event_key.to_string());
                Ok(())
            })
        }

        fn schedule_retry<'a>(
            &'a self,
            id: OutboxId,
            delay: Duration,
            error_text: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
            Box::pin(async move {
                let now = self.now();
                if let Some(row) = self.state.write().await.rows.get_mut(&id) {
                    row.attempts += 1;
                    row.last_error = Some(error_text.to_string());
                    row.next_retry_at = Some(now + to_chrono(delay));
                    row.locked_by = None;
                    row.lock_expires_at = None;
                }
                Ok(())
            })
        }

        fn move_to_dead_letter<'a>(
            &'a self,
            id: OutboxId,
            error_text: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
            Box::pin(async move {
                let now = self.now();
                let mut state = self.state.write().await;
                let Some(row) = state.rows.remove(&id) else {
                    return Ok(false);
                };
                let entry_id = i64::try_from(state.dead_letters.len()).unwrap_or(i64::MAX) + 1;
                state.dead_letters.push(DeadLetterEntry {
                    id: entry_id,
                    outbox_id: row.id,
                    txid: row.txid,
                    table_name: row.table_name,
                    record_id: row.record_id,
                    operation: row.operation,
                    payload_json: row.payload_json,
                    error_text: error_text.to_string(),
                    attempts: row.attempts,
                    first_failed_at: now,
                    last_failed_at: now,
                });
                Ok(true)
            })
        }

        fn backlog_stats(&self) -> Pin<Box<dyn Future<Output = Result<BacklogStats>> + Send + '_>> {
            Box::pin(async move {
                let now = self.now();
                let state = self.state.read().await;
                let pending = state.rows.values().filter(|row| !row.processed);
                let mut stats = BacklogStats::default();
                for row in pending.filter(|row| row.is_retry_ready(now)) {
                    stats.unprocessed += 1;
                    stats.oldest_ready_at = Some(
                        stats.oldest_ready_at.map_or(row.created_at, |at| at.min(row.created_at)),
                    );
                }
                Ok(stats)
            })
        }

        fn dead_letter_count(&self) -> Pin<Box<dyn Future<Output = Result<i64>> + Send + '_>> {
            Box::pin(async move {
                Ok(i64::try_from(self.state.read().await.dead_letters.len()).unwrap_or(i64::MAX))
            })
        }
    }
}
