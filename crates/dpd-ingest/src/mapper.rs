//! Enriched record -> remote row

use crate::types::EnrichedRecord;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A row ready for insertion into the remote table.
///
/// Serializes flat: `row_uid`, `source`, `match_bucket` and every payload
/// column side by side, matching the table layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappedRow {
    pub row_uid: String,
    pub source: String,
    pub match_bucket: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

/// `"{source}:{natural_key}"`, the dedup key shared with the remote table
pub fn row_uid(source: &str, natural_key: &str) -> String {
    format!("{source}:{natural_key}")
}

pub fn map_record(source: &str, record: &EnrichedRecord) -> MappedRow {
    let key = record.natural_key.trim();
    let mut payload: Map<String, Value> = record
        .fields
        .iter()
        .map(|(column, value)| (column.clone(), Value::String(value.clone())))
        .collect();
    payload.insert("din_match_key".to_string(), Value::String(key.to_string()));
    payload.insert("DIN/NPN".to_string(), Value::String(key.to_string()));

    MappedRow {
        row_uid: row_uid(source, key),
        source: source.to_string(),
        match_bucket: source.to_string(),
        payload,
    }
}

pub fn map_records(source: &str, records: &[EnrichedRecord]) -> Vec<MappedRow> {
    records.iter().map(|r| map_record(source, r)).collect()
}
