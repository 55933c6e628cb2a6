//! Folding a group's payload fragments into one record.
//!
//! Each trigger row carries only the columns of its own source table. A
//! group is merged in ascending row id so later changes in the transaction
//! win on overlapping keys, independent of the order rows were fetched in.

use serde_json::{Map, Value};
use sluice_core::OutboxEvent;

/// Merged payload of a group, keyed by field name in first-seen order.
pub type MergedRecord = Map<String, Value>;

/// Shallow-merges the JSON object payloads of `rows` in ascending id order.
///
/// Payloads that are not objects (including `null`) contribute nothing.
pub fn merge_payloads(rows: &[OutboxEvent]) -> MergedRecord {
    let mut ordered: Vec<&OutboxEvent> = rows.iter().collect();
    ordered.sort_by_key(|row| row.id);

    let mut merged = MergedRecord::new();
    for row in ordered {
        if let Value::Object(fields) = &row.payload_json {
            for (key, value) in fields {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

/// Ledger key for a group: `<table_name>|<record_id>|<txid>` of its lowest-id row.
pub fn event_key(rows: &[OutboxEvent]) -> Option<String> {
    rows.iter()
        .min_by_key(|row| row.id)
        .map(|first| format!("{}|{}|{}", first.table_name, first.record_id, first.txid))
}
