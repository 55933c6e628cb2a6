//! Repository for `fhir_dlq`.
//!
//! Entries are written once when a row fails permanently and are never
//! updated or removed by the worker.

use std::sync::Arc;

use sqlx::{PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{DeadLetterEntry, OutboxId},
};

/// Repository for dead-letter entries.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Copies an outbox row into the dead-letter table.
    ///
    /// Returns the new entry id, or `None` when the outbox row is gone.
    /// Callers delete the outbox row in the same transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn copy_from_outbox_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        outbox_id: OutboxId,
        error_text: &str,
    ) -> Result<Option<i64>> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO fhir_dlq (
                outbox_id, txid, table_name, record_id, operation, payload_json,
                error_text, attempts, first_failed_at, last_failed_at
            )
            SELECT id, txid, table_name, record_id, operation, payload_json,
                   $2, attempts, NOW(), NOW()
            FROM fhir_outbox
            WHERE id = $1
            RETURNING id
            "#,
        )
        .bind(outbox_id)
        .bind(error_text)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(id)
    }

    /// Finds the entry created for an outbox row.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_outbox_id(&self, outbox_id: OutboxId) -> Result<Option<DeadLetterEntry>> {
        let entry = sqlx::query_as::<_, DeadLetterEntry>(
            r#"
            SELECT id, outbox_id, txid, table_name, record_id, operation, payload_json,
                   error_text, attempts, first_failed_at, last_failed_at
            FROM fhir_dlq
            WHERE outbox_id = $1
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(outbox_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(entry)
    }

    /// Total number of dead-lettered rows.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM fhir_dlq").fetch_one(&*self.pool).await?;
        Ok(count)
    }
}
