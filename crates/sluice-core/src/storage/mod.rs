//! PostgreSQL repositories for the outbox, dead-letter and ledger tables.
//!
//! Every SQL statement sluice runs lives under this module. The tables are
//! provisioned by the upstream schema; nothing here creates or alters them.

use std::{sync::Arc, time::Duration};

use sqlx::PgPool;
use tracing::debug;

pub mod dead_letters;
pub mod outbox_events;
pub mod processed_events;

use crate::{error::Result, models::OutboxId};

/// Shared handle over all repositories.
///
/// Built once by the process entry point and passed to every component that
/// needs the store.
#[derive(Clone)]
pub struct Storage {
    pool: Arc<PgPool>,

    /// Repository for `fhir_outbox`.
    pub outbox_events: Arc<outbox_events::Repository>,

    /// Repository for `fhir_dlq`.
    pub dead_letters: Arc<dead_letters::Repository>,

    /// Repository for `fhir_processed_event`.
    pub processed_events: Arc<processed_events::Repository>,
}

impl Storage {
    /// Creates the repositories over a shared pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            outbox_events: Arc::new(outbox_events::Repository::new(pool.clone())),
            dead_letters: Arc::new(dead_letters::Repository::new(pool.clone())),
            processed_events: Arc::new(processed_events::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Moves an outbox row into the dead-letter table.
    ///
    /// The snapshot insert and the outbox delete commit together. Returns
    /// `false` when the row no longer exists.
    ///
    /// # Errors
    ///
    /// Returns error if either statement or the commit fails.
    pub async fn dead_letter(&self, id: OutboxId, error_text: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let moved = self.dead_letters.copy_from_outbox_in_tx(&mut tx, id, error_text).await?;
        if moved.is_none() {
            tx.rollback().await?;
            debug!(outbox_id = %id, "outbox row vanished before dead-lettering");
            return Ok(false);
        }

        self.outbox_events.delete_in_tx(&mut tx, id).await?;
        tx.commit().await?;

        Ok(true)
    }

    /// Verifies the store answers queries.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the query fails.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;
        Ok(())
    }
}

/// Converts a lease or retry delay into a Postgres interval bind value.
pub(crate) fn interval(duration: Duration) -> Duration {
    // Postgres intervals carry microsecond precision.
    Duration::from_micros(u64::try_from(duration.as_micros()).unwrap_or(u64::MAX))
}
