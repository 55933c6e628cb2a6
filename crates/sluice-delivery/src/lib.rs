//! Claim-and-deliver engine for the sluice outbox worker.
//!
//! Rows written by database triggers are claimed under a time-bounded lease,
//! grouped by source transaction and patient, merged into a single FHIR
//! `Patient` resource and delivered with an idempotent PUT. Each group then
//! settles exactly one way: marked processed with a ledger entry, scheduled
//! for retry, or moved to the dead-letter table.
//!
//! Work is driven two ways. A notification on the outbox channel drains a
//! bounded burst of groups, and a fixed-interval poll processes at most one
//! group per tick as a safety net for missed notifications.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod claim;
pub mod client;
pub mod engine;
pub mod error;
pub mod listener;
pub mod mapper;
pub mod merge;
pub mod outcome;
pub mod retry;
pub mod storage;
pub mod telemetry;
pub mod worker;

pub use claim::ClaimCoordinator;
pub use client::{ClientConfig, DeliveryGateway, FhirClient};
pub use engine::{DeliveryConfig, DeliveryEngine, EngineStats};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use listener::{ChangeNotifications, PgChangeListener};
pub use mapper::{build_patient_resource, PatientResource};
pub use merge::{event_key, merge_payloads, MergedRecord};
pub use outcome::OutcomeResolver;
pub use retry::{RetryDecision, RetryPolicy};
pub use storage::{OutboxStorage, PostgresOutboxStorage};
pub use worker::{CycleOutcome, OutboxWorker};

/// Default FHIR server base URL.
pub const DEFAULT_FHIR_SERVER: &str = "https://fhir-bootcamp.medblocks.com/fhir/";

/// Default notification channel written to by the outbox trigger.
pub const DEFAULT_CHANNEL: &str = "fhir_outbox_event";

/// Default attempt ceiling carried in configuration.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default per-request timeout for FHIR calls.
pub const DEFAULT_DELIVERY_TIMEOUT_MS: u64 = 15_000;

/// Default interval between poll ticks.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;

/// Default number of groups drained per notification.
pub const DEFAULT_BURST_LIMIT: usize = 5;
