//! Core outbox domain for the sluice delivery worker.
//!
//! Holds the row models read from the transactional outbox, the error type
//! shared by every repository, the clock abstraction used to keep lease and
//! retry timing testable, and the PostgreSQL repositories that own every SQL
//! statement the worker issues.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    BacklogStats, DeadLetterEntry, GroupKey, Operation, OutboxEvent, OutboxId, PatientId,
    ProcessedEvent, ResourceRef, TxId,
};
pub use time::{Clock, RealClock, TestClock};

/// Fixed lease granted to a worker when it claims outbox rows.
///
/// Leases are never renewed. Delivery calls must finish well inside this
/// window or the rows become claimable by another worker.
pub const LEASE_DURATION: std::time::Duration = std::time::Duration::from_secs(30);
