//! Repository for `fhir_outbox`.
//!
//! Claims are single conditional `UPDATE ... RETURNING` statements so that
//! selection and lease acquisition happen atomically. No claim path reads a
//! row and then writes it in a second round trip.

use std::{sync::Arc, time::Duration};

use sqlx::{PgPool, Postgres, Transaction};

use super::interval;
use crate::{
    error::Result,
    models::{BacklogStats, OutboxEvent, OutboxId, PatientId, ResourceRef, TxId},
};

/// Repository for outbox rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Leases the oldest claimable row to `worker_id`.
    ///
    /// The inner select skips rows locked by concurrent claimers and the
    /// outer predicate re-checks eligibility, so two workers can never leave
    /// this statement holding the same row.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn claim_one(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<OutboxEvent>> {
        let event = sqlx::query_as::<_, OutboxEvent>(
            r#"
            UPDATE fhir_outbox
            SET locked_by = $1, lock_expires_at = NOW() + $2
            WHERE id = (
                SELECT id FROM fhir_outbox
                WHERE processed = false
                  AND (next_retry_at IS NULL OR next_retry_at <= NOW())
                  AND (locked_by IS NULL OR lock_expires_at <= NOW())
                ORDER BY created_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
              AND processed = false
              AND (locked_by IS NULL OR lock_expires_at <= NOW())
            RETURNING id, txid, sequence_in_tx, table_name, record_id, operation,
                      payload_json, patient_id, identifier_system, identifier_value,
                      created_at, processed, processed_at, attempts, next_retry_at,
                      locked_by, lock_expires_at, fhir_resource_id, fhir_version, last_error
            "#,
        )
        .bind(worker_id)
        .bind(interval(lease))
        .fetch_optional(&*self.pool)
        .await?;

        Ok(event)
    }

    /// Leases every claimable row of a transaction/patient group.
    ///
    /// The `anchor` row returned by [`Repository::claim_one`] is adopted when
    /// `worker_id` still holds it. Other rows leased by `worker_id` are not,
    /// so two cycles running under one identity never share a group. A
    /// `None` patient matches only rows whose patient id is null.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn claim_group(
        &self,
        worker_id: &str,
        anchor: OutboxId,
        txid: TxId,
        patient_id: Option<PatientId>,
        lease: Duration,
    ) -> Result<Vec<OutboxEvent>> {
        let mut events = sqlx::query_as::<_, OutboxEvent>(
            r#"
            UPDATE fhir_outbox
            SET locked_by = $1, lock_expires_at = NOW() + $4
            WHERE processed = false
              AND txid = $2
              AND patient_id IS NOT DISTINCT FROM $3
              AND (next_retry_at IS NULL OR next_retry_at <= NOW())
              AND (locked_by IS NULL OR lock_expires_at <= NOW() OR (id = $5 AND locked_by = $1))
            RETURNING id, txid, sequence_in_tx, table_name, record_id, operation,
                      payload_json, patient_id, identifier_system, identifier_value,
                      created_at, processed, processed_at, attempts, next_retry_at,
                      locked_by, lock_expires_at, fhir_resource_id, fhir_version, last_error
            "#,
        )
        .bind(worker_id)
        .bind(txid)
        .bind(patient_id)
        .bind(interval(lease))
        .bind(anchor)
        .fetch_all(&*self.pool)
        .await?;

        events.sort_by_key(|event| event.id);
        Ok(events)
    }

    /// Reads the unprocessed rows of a group that `worker_id` currently holds.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_leased_group(
        &self,
        worker_id: &str,
        txid: TxId,
        patient_id: Option<PatientId>,
    ) -> Result<Vec<OutboxEvent>> {
        let events = sqlx::query_as::<_, OutboxEvent>(
            r#"
            SELECT id, txid, sequence_in_tx, table_name, record_id, operation,
                   payload_json, patient_id, identifier_system, identifier_value,
                   created_at, processed, processed_at, attempts, next_retry_at,
                   locked_by, lock_expires_at, fhir_resource_id, fhir_version, last_error
            FROM fhir_outbox
            WHERE processed = false
              AND txid = $2
              AND patient_id IS NOT DISTINCT FROM $3
              AND locked_by = $1
            ORDER BY id ASC
            "#,
        )
        .bind(worker_id)
        .bind(txid)
        .bind(patient_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(events)
    }

    /// Marks rows delivered and releases their leases.
    ///
    /// Returns the number of rows updated.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_processed(&self, ids: &[OutboxId], resource: &ResourceRef) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let ids: Vec<i64> = ids.iter().map(|id| id.0).collect();
        let result = sqlx::query(
            r#"
            UPDATE fhir_outbox
            SET processed = true,
                processed_at = NOW(),
                fhir_resource_id = $2,
                fhir_version = $3,
                locked_by = NULL,
                lock_expires_at = NULL
            WHERE id = ANY($1)
            "#,
        )
        .bind(&ids)
        .bind(resource.id.as_deref())
        .bind(resource.version.as_deref())
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Records a failed attempt and pushes the row's next claim out by `delay`.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn schedule_retry(
        &self,
        id: OutboxId,
        delay: Duration,
        error_text: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE fhir_outbox
            SET attempts = attempts + 1,
                last_error = $2,
                next_retry_at = NOW() + $3,
                locked_by = NULL,
                lock_expires_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error_text)
        .bind(interval(delay))
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Deletes a row inside a caller-owned transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn delete_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: OutboxId,
    ) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM fhir_outbox WHERE id = $1").bind(id).execute(&mut **tx).await?;

        Ok(result.rows_affected())
    }

    /// Finds a row by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: OutboxId) -> Result<Option<OutboxEvent>> {
        let event = sqlx::query_as::<_, OutboxEvent>(
            r#"
            SELECT id, txid, sequence_in_tx, table_name, record_id, operation,
                   payload_json, patient_id, identifier_system, identifier_value,
                   created_at, processed, processed_at, attempts, next_retry_at,
                   locked_by, lock_expires_at, fhir_resource_id, fhir_version, last_error
            FROM fhir_outbox
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(event)
    }

    /// Counts unprocessed rows whose retry time has passed and finds the
    /// oldest of them.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn backlog_stats(&self) -> Result<BacklogStats> {
        let stats = sqlx::query_as::<_, BacklogStats>(
            r#"
            SELECT COUNT(*) AS unprocessed,
                   MIN(created_at) AS oldest_ready_at
            FROM fhir_outbox
            WHERE processed = false
              AND (next_retry_at IS NULL OR next_retry_at <= NOW())
            "#,
        )
        .fetch_one(&*self.pool)
        .await?;

        Ok(stats)
    }
}
