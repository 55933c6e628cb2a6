//! Metric names emitted by the delivery engine.
//!
//! Metrics go through the `metrics` facade. Nothing is recorded until the
//! binary installs an exporter, so library code and tests can emit freely.

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

/// Outbox rows settled as delivered.
pub const PROCESSED_TOTAL: &str = "sluice_processed_total";

/// Outbox rows scheduled for retry or dead-lettered.
pub const FAILED_TOTAL: &str = "sluice_failed_total";

/// Failed FHIR server calls, labelled by `kind`.
pub const FHIR_CALL_ERRORS_TOTAL: &str = "fhir_call_errors_total";

/// FHIR server call latency.
pub const FHIR_CALL_LATENCY_SECONDS: &str = "fhir_call_latency_seconds";

/// Age of the oldest claimable outbox row.
pub const OUTBOX_LAG_SECONDS: &str = "fhir_outbox_lag_seconds";

/// Unprocessed outbox rows whose retry time has passed.
pub const OUTBOX_UNPROCESSED_COUNT: &str = "fhir_outbox_unprocessed_count";

/// Rows in the dead-letter table.
pub const DLQ_TOTAL: &str = "fhir_dlq_total";

/// Histogram buckets for [`FHIR_CALL_LATENCY_SECONDS`].
pub const LATENCY_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0];

/// Registers help text for every metric with the installed recorder.
pub fn describe_metrics() {
    describe_counter!(PROCESSED_TOTAL, Unit::Count, "Outbox rows delivered to the FHIR server");
    describe_counter!(FAILED_TOTAL, Unit::Count, "Outbox rows that failed delivery");
    describe_counter!(FHIR_CALL_ERRORS_TOTAL, Unit::Count, "FHIR server calls that failed");
    describe_histogram!(FHIR_CALL_LATENCY_SECONDS, Unit::Seconds, "FHIR server call latency");
    describe_gauge!(OUTBOX_LAG_SECONDS, Unit::Seconds, "Age of the oldest claimable outbox row");
    describe_gauge!(OUTBOX_UNPROCESSED_COUNT, Unit::Count, "Unprocessed outbox rows ready for delivery");
    describe_gauge!(DLQ_TOTAL, Unit::Count, "Rows in the dead-letter table");
}
