//! Records flowing through a stage.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One work item: an opaque map of named fields.
pub type Record = Map<String, Value>;

/// An ordered sequence of records, the unit persisted between stages.
pub type RecordSet = Vec<Record>;

/// Value counts of `field` across `records`.
///
/// String values are counted verbatim, other JSON values by their compact JSON
/// rendering. Records without the field are counted under `"unknown"`.
pub fn field_distribution(records: &[Record], field: &str) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for record in records {
        let key = match record.get(field) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => "unknown".to_string(),
            Some(other) => other.to_string(),
        };
        *counts.entry(key).or_insert(0) += 1;
    }
    counts
}
