//! Repository for the `fhir_processed_event` idempotency ledger.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{error::Result, models::ProcessedEvent};

/// Repository for ledger entries.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Appends a ledger entry for a delivered group.
    ///
    /// The key column is unique. Writing the same key twice is reported as
    /// an error rather than ignored.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConstraintViolation` when the key already exists,
    /// or `CoreError::Database` if the insert fails for another reason.
    pub async fn record(&self, event_key: &str) -> Result<()> {
        sqlx::query("INSERT INTO fhir_processed_event (event_key, processed_at) VALUES ($1, NOW())")
            .bind(event_key)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    /// Looks up a ledger entry by key.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find(&self, event_key: &str) -> Result<Option<ProcessedEvent>> {
        let entry = sqlx::query_as::<_, ProcessedEvent>(
            "SELECT event_key, processed_at FROM fhir_processed_event WHERE event_key = $1",
        )
        .bind(event_key)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(entry)
    }
}
