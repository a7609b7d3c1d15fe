//! Drop rows the remote store already holds

use crate::mapper::MappedRow;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupSummary {
    pub candidates: usize,
    pub already_present: usize,
    pub to_insert: usize,
}

/// Rows whose `row_uid` is not in `existing`, in their original order
pub fn filter(rows: Vec<MappedRow>, existing: &HashSet<String>) -> Vec<MappedRow> {
    rows.into_iter()
        .filter(|row| !existing.contains(&row.row_uid))
        .collect()
}

/// Keep the first row for each `row_uid`; returns the survivors and how
/// many repeats were dropped
pub fn drop_repeated(rows: Vec<MappedRow>) -> (Vec<MappedRow>, usize) {
    let before = rows.len();
    let mut seen: HashSet<String> = HashSet::with_capacity(before);
    let kept: Vec<MappedRow> = rows
        .into_iter()
        .filter(|row| seen.insert(row.row_uid.clone()))
        .collect();
    let dropped = before - kept.len();
    (kept, dropped)
}

/// [`filter`] plus counts for reporting
pub fn filter_with_summary(
    rows: Vec<MappedRow>,
    existing: &HashSet<String>,
) -> (Vec<MappedRow>, DedupSummary) {
    let candidates = rows.len();
    let already_present = rows.iter().filter(|r| existing.contains(&r.row_uid)).count();
    let kept = filter(rows, existing);
    let summary = DedupSummary {
        candidates,
        already_present,
        to_insert: kept.len(),
    };
    (kept, summary)
}
