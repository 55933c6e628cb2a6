//! Outbox row models and strongly-typed identifiers.
//!
//! The tables these types map onto are owned by upstream triggers; sluice
//! reads and updates them but never creates or migrates them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Primary key of a `fhir_outbox` row.
///
/// Assigned from a sequence, so ordering by id is ordering by insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutboxId(pub i64);

impl fmt::Display for OutboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl sqlx::Type<PgDb> for OutboxId {
    fn type_info() -> PgTypeInfo {
        <i64 as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for OutboxId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        Ok(Self(<i64 as sqlx::Decode<PgDb>>::decode(value)?))
    }
}

impl sqlx::Encode<'_, PgDb> for OutboxId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <i64 as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Source database transaction id captured by the outbox trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxId(pub i64);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl sqlx::Type<PgDb> for TxId {
    fn type_info() -> PgTypeInfo {
        <i64 as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for TxId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        Ok(Self(<i64 as sqlx::Decode<PgDb>>::decode(value)?))
    }
}

impl sqlx::Encode<'_, PgDb> for TxId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <i64 as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Patient correlation id carried on clinical rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatientId(pub i32);

impl fmt::Display for PatientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl sqlx::Type<PgDb> for PatientId {
    fn type_info() -> PgTypeInfo {
        <i32 as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for PatientId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        Ok(Self(<i32 as sqlx::Decode<PgDb>>::decode(value)?))
    }
}

impl sqlx::Encode<'_, PgDb> for PatientId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <i32 as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Kind of change recorded by the trigger, stored as `CHAR(1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// `I`
    Insert,
    /// `U`
    Update,
    /// `D`
    Delete,
}

impl Operation {
    /// Single-character code used in the outbox and dead-letter tables.
    pub const fn code(self) -> &'static str {
        match self {
            Self::Insert => "I",
            Self::Update => "U",
            Self::Delete => "D",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl std::str::FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "I" | "i" => Ok(Self::Insert),
            "U" | "u" => Ok(Self::Update),
            "D" | "d" => Ok(Self::Delete),
            other => Err(format!("invalid outbox operation: {other:?}")),
        }
    }
}

impl sqlx::Type<PgDb> for Operation {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }

    // CHAR(1) arrives as BPCHAR, which the text decoder accepts.
    fn compatible(ty: &PgTypeInfo) -> bool {
        <&str as sqlx::Type<PgDb>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for Operation {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse().map_err(Into::into)
    }
}

impl sqlx::Encode<'_, PgDb> for Operation {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.code(), buf)
    }
}

/// One change row in `fhir_outbox`.
///
/// A row is claimable only while it is unprocessed, its retry time has
/// passed and no other worker holds an unexpired lease on it. Once
/// `processed` is set the row is never claimed again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboxEvent {
    /// Row id, monotonic in insertion order.
    pub id: OutboxId,
    /// Source transaction id.
    pub txid: TxId,
    /// Position of the change inside its source transaction.
    pub sequence_in_tx: i32,
    /// Source table the change came from.
    pub table_name: String,
    /// Primary key of the changed source row.
    pub record_id: i32,
    /// Insert, update or delete.
    pub operation: Operation,
    /// Partial patient record captured by the trigger.
    pub payload_json: Value,
    /// Patient correlation id, absent for rows not tied to a patient.
    pub patient_id: Option<PatientId>,
    /// Identifier system used for conditional writes.
    pub identifier_system: Option<String>,
    /// Identifier value used for conditional writes.
    pub identifier_value: Option<String>,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
    /// Set once the row's group was delivered.
    pub processed: bool,
    /// When the row was marked processed.
    pub processed_at: Option<DateTime<Utc>>,
    /// Failed delivery attempts so far.
    pub attempts: i32,
    /// Earliest time the row may be claimed again.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Worker currently holding the lease.
    pub locked_by: Option<String>,
    /// Lease expiry.
    pub lock_expires_at: Option<DateTime<Utc>>,
    /// Downstream resource id once delivered.
    pub fhir_resource_id: Option<String>,
    /// Downstream resource version once delivered.
    pub fhir_version: Option<String>,
    /// Text of the most recent delivery failure.
    pub last_error: Option<String>,
}

impl OutboxEvent {
    /// Key that groups rows into one delivery.
    pub fn group_key(&self) -> GroupKey {
        GroupKey { txid: self.txid, patient_id: self.patient_id }
    }

    /// True when the retry window, if any, has passed.
    pub fn is_retry_ready(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// True when no unexpired lease is held on the row.
    pub fn is_unleased(&self, now: DateTime<Utc>) -> bool {
        self.locked_by.is_none() || self.lock_expires_at.is_some_and(|at| at <= now)
    }

    /// True when `worker_id` holds the row's lease.
    pub fn is_leased_by(&self, worker_id: &str) -> bool {
        self.locked_by.as_deref() == Some(worker_id)
    }

    /// Eligibility predicate shared by every claim path.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        !self.processed && self.is_retry_ready(now) && self.is_unleased(now)
    }
}

/// Rows from one source transaction about one patient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupKey {
    /// Source transaction.
    pub txid: TxId,
    /// Patient correlation id; `None` groups only with other `None` rows.
    pub patient_id: Option<PatientId>,
}

impl GroupKey {
    /// True when `event` belongs to this group.
    pub fn matches(&self, event: &OutboxEvent) -> bool {
        event.txid == self.txid && event.patient_id == self.patient_id
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.patient_id {
            Some(patient) => write!(f, "tx {} / patient {}", self.txid, patient),
            None => write!(f, "tx {} / no patient", self.txid),
        }
    }
}

/// Permanently failed row copied into `fhir_dlq`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeadLetterEntry {
    /// Dead-letter row id.
    pub id: i64,
    /// Originating outbox row.
    pub outbox_id: OutboxId,
    /// Source transaction.
    pub txid: TxId,
    /// Source table.
    pub table_name: String,
    /// Source row key.
    pub record_id: i32,
    /// Change kind.
    pub operation: Operation,
    /// Payload snapshot at the time of failure.
    pub payload_json: Value,
    /// Failure description.
    pub error_text: String,
    /// Attempts recorded on the outbox row.
    pub attempts: i32,
    /// First failure time.
    pub first_failed_at: DateTime<Utc>,
    /// Last failure time.
    pub last_failed_at: DateTime<Utc>,
}

/// Idempotency ledger entry in `fhir_processed_event`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProcessedEvent {
    /// `<table_name>|<record_id>|<txid>` of the group's first row.
    pub event_key: String,
    /// When the group was delivered.
    pub processed_at: DateTime<Utc>,
}

/// Downstream resource identity returned by a successful write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    /// Server-assigned logical id.
    pub id: Option<String>,
    /// Server-assigned version id.
    pub version: Option<String>,
}

/// Snapshot of the outbox backlog used for operational gauges.
#[derive(Debug, Clone, Default, PartialEq, Eq, sqlx::FromRow)]
pub struct BacklogStats {
    /// Unprocessed rows whose retry time has passed.
    pub unprocessed: i64,
    /// Creation time of the oldest unprocessed row that is ready to claim.
    pub oldest_ready_at: Option<DateTime<Utc>>,
}

impl BacklogStats {
    /// Age of the oldest ready row relative to `now`, zero when idle.
    pub fn lag_seconds(&self, now: DateTime<Utc>) -> f64 {
        self.oldest_ready_at
            .map(|at| (now - at).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(0.0)
    }
}
