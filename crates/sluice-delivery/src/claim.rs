//! Lease acquisition for single rows and whole groups.
//!
//! A cycle starts by leasing the oldest claimable row, then widens the lease
//! to every row sharing its transaction id and patient id. Both steps are
//! single conditional updates in the store, so concurrent workers can never
//! hold a valid lease on the same row.

use std::{sync::Arc, time::Duration};

use sluice_core::{OutboxEvent, LEASE_DURATION};
use tracing::{debug, warn};

use crate::{error::Result, storage::OutboxStorage};

/// Claims rows on behalf of one worker identity.
#[derive(Clone)]
pub struct ClaimCoordinator {
    storage: Arc<dyn OutboxStorage>,
    worker_id: String,
    lease: Duration,
}

impl ClaimCoordinator {
    /// Creates a coordinator using the fixed [`LEASE_DURATION`].
    pub fn new(storage: Arc<dyn OutboxStorage>, worker_id: impl Into<String>) -> Self {
        Self::with_lease(storage, worker_id, LEASE_DURATION)
    }

    /// Creates a coordinator with an explicit lease length.
    pub fn with_lease(
        storage: Arc<dyn OutboxStorage>,
        worker_id: impl Into<String>,
        lease: Duration,
    ) -> Self {
        Self { storage, worker_id: worker_id.into(), lease }
    }

    /// Worker identity written into `locked_by`.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Leases the oldest claimable row, if any.
    ///
    /// # Errors
    ///
    /// Returns a database error if the claim statement fails.
    pub async fn claim_one(&self) -> Result<Option<OutboxEvent>> {
        let claimed = self.storage.claim_one(&self.worker_id, self.lease).await?;
        if let Some(event) = &claimed {
            debug!(
                worker_id = %self.worker_id,
                outbox_id = %event.id,
                txid = %event.txid,
                "claimed outbox row"
            );
        }
        Ok(claimed)
    }

    /// Leases every claimable row in `anchor`'s group, keeping `anchor`
    /// itself.
    ///
    /// Rows this worker identity leased in another cycle are not adopted. If
    /// the group update fails or returns nothing, the rows this worker
    /// already holds for the group are read back instead. An empty result
    /// means another worker won the group.
    ///
    /// # Errors
    ///
    /// Returns a database error only if the read-back also fails.
    pub async fn claim_group(&self, anchor: &OutboxEvent) -> Result<Vec<OutboxEvent>> {
        let key = anchor.group_key();
        match self
            .storage
            .claim_group(&self.worker_id, anchor.id, key.txid, key.patient_id, self.lease)
            .await
        {
            Ok(rows) if !rows.is_empty() => return Ok(sorted(rows)),
            Ok(_) => debug!(group = %key, "group claim matched no rows, reading back held rows"),
            Err(error) => warn!(
                group = %key,
                error = %error,
                "group claim failed, reading back held rows"
            ),
        }

        let held =
            self.storage.find_leased_group(&self.worker_id, key.txid, key.patient_id).await?;
        Ok(sorted(held))
    }
}

fn sorted(mut rows: Vec<OutboxEvent>) -> Vec<OutboxEvent> {
    rows.sort_by_key(|row| row.id);
    rows
}
