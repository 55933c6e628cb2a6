//! One claim-merge-deliver-settle cycle.

use std::sync::Arc;

use sluice_core::{OutboxEvent, ResourceRef};
use tracing::{debug, Instrument};

use crate::{
    claim::ClaimCoordinator,
    client::DeliveryGateway,
    error::Result,
    mapper::{build_patient_resource, PatientResource},
    merge::merge_payloads,
    outcome::{FailureResolution, OutcomeResolver},
};

/// Result of a single [`OutboxWorker::process_claimed`] cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No claimable row was found.
    Idle,
    /// The group was delivered and marked processed.
    Delivered {
        /// Rows in the group
        rows: usize,
        /// Reference returned by the server
        resource: ResourceRef,
    },
    /// The group failed with a retryable error and was rescheduled.
    RetryScheduled {
        /// Rows in the group
        rows: usize,
    },
    /// The server rejected the group and it was moved to the dead-letter
    /// table.
    DeadLettered {
        /// Rows in the group
        rows: usize,
    },
    /// The group had no address on the server and was dead-lettered without
    /// a request.
    Undeliverable {
        /// Rows in the group
        rows: usize,
    },
    /// Another worker took the group between the two claims.
    RaceLost,
}

impl CycleOutcome {
    /// Whether a burst should keep draining after this cycle.
    ///
    /// Only a delivery or an undeliverable group keeps the burst going. Any
    /// failed request ends it, whether retried or dead-lettered, as do an
    /// idle store and a lost race.
    pub fn did_work(&self) -> bool {
        matches!(self, Self::Delivered { .. } | Self::Undeliverable { .. })
    }
}

/// How a group is addressed on the FHIR server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryTarget {
    /// `PUT Patient?identifier=system|value`.
    Conditional {
        /// Identifier namespace
        system: String,
        /// Identifier value
        value: String,
    },
    /// `PUT Patient/{id}` using a previously returned resource id.
    ById(String),
}

impl DeliveryTarget {
    /// Picks the write for a group: the resource's first identifier, else the
    /// resource id recorded on the group's lowest-id row.
    pub fn select(resource: &PatientResource, rows: &[OutboxEvent]) -> Option<Self> {
        if let Some(identifier) = resource.primary_identifier() {
            return Some(Self::Conditional {
                system: identifier.system.clone(),
                value: identifier.value.clone(),
            });
        }

        rows.iter()
            .min_by_key(|row| row.id)
            .and_then(|row| row.fhir_resource_id.clone())
            .filter(|id| !id.is_empty())
            .map(Self::ById)
    }
}

/// Runs delivery cycles for one worker identity.
#[derive(Clone)]
pub struct OutboxWorker {
    claims: ClaimCoordinator,
    gateway: Arc<dyn DeliveryGateway>,
    resolver: OutcomeResolver,
}

impl OutboxWorker {
    /// Creates a worker from its collaborators.
    pub fn new(
        claims: ClaimCoordinator,
        gateway: Arc<dyn DeliveryGateway>,
        resolver: OutcomeResolver,
    ) -> Self {
        Self { claims, gateway, resolver }
    }

    /// Worker identity used for leases.
    pub fn worker_id(&self) -> &str {
        self.claims.worker_id()
    }

    /// Claims the oldest eligible row, widens the claim to its group, and
    /// delivers the merged group.
    ///
    /// Delivery failures are settled here and reported through the returned
    /// outcome; they are not errors.
    ///
    /// # Errors
    ///
    /// Returns an error when a store operation fails. Rows leased before the
    /// failure become claimable again once their lease expires.
    pub async fn process_claimed(&self) -> Result<CycleOutcome> {
        let Some(anchor) = self.claims.claim_one().await? else {
            return Ok(CycleOutcome::Idle);
        };

        let key = anchor.group_key();
        async {
            let rows = self.claims.claim_group(&anchor).await?;
            if rows.is_empty() {
                self.resolver.race_lost(&anchor).await?;
                return Ok(CycleOutcome::RaceLost);
            }
            self.deliver_group(rows).await
        }
        .instrument(tracing::debug_span!("outbox_cycle", worker_id = %self.worker_id(), group = %key))
        .await
    }

    async fn deliver_group(&self, rows: Vec<OutboxEvent>) -> Result<CycleOutcome> {
        let merged = merge_payloads(&rows);
        let resource = build_patient_resource(&merged);
        debug!(count = rows.len(), fields = merged.len(), "merged group payloads");

        let Some(target) = DeliveryTarget::select(&resource, &rows) else {
            self.resolver.undeliverable(&rows).await?;
            return Ok(CycleOutcome::Undeliverable { rows: rows.len() });
        };

        let delivery = match &target {
            DeliveryTarget::Conditional { system, value } => {
                self.gateway.deliver_conditional(system, value, &resource).await
            },
            DeliveryTarget::ById(resource_id) => {
                self.gateway.deliver_by_id(resource_id, &resource).await
            },
        };

        match delivery {
            Ok(reference) => {
                self.resolver.delivered(&rows, &reference).await?;
                Ok(CycleOutcome::Delivered { rows: rows.len(), resource: reference })
            },
            Err(failure) => match self.resolver.failed(&rows, &failure).await? {
                FailureResolution::Retried => Ok(CycleOutcome::RetryScheduled { rows: rows.len() }),
                FailureResolution::DeadLettered => {
                    Ok(CycleOutcome::DeadLettered { rows: rows.len() })
                },
            },
        }
    }
}
