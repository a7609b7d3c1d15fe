//! Record types flowing through the scrape stage

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Column name -> value, ordered so serialized records are stable
pub type Fields = BTreeMap<String, String>;

/// Position of the next listing item to pull.
///
/// Pages are 1-based like the DPD `results_page` parameter; `index` is the
/// 0-based offset of the item inside its page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ListingCursor {
    pub page: u64,
    pub index: usize,
}

impl ListingCursor {
    pub const START: ListingCursor = ListingCursor { page: 1, index: 0 };

    pub fn new(page: u64, index: usize) -> Self {
        Self { page, index }
    }

    pub fn next_item(self) -> Self {
        Self {
            page: self.page,
            index: self.index + 1,
        }
    }

    pub fn next_page(self) -> Self {
        Self {
            page: self.page + 1,
            index: 0,
        }
    }
}

impl Default for ListingCursor {
    fn default() -> Self {
        Self::START
    }
}

impl fmt::Display for ListingCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page {} item {}", self.page, self.index)
    }
}

/// One row of a listing page as returned by a [`crate::source::SourceClient`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingEntry {
    /// Stable identifier (the DIN for DPD)
    pub natural_key: String,
    /// Where the detail page lives; empty when the listing has no link
    pub source_id: String,
    pub fields: Fields,
}

/// A listing entry together with where it was found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemReference {
    pub natural_key: String,
    pub source_id: String,
    pub position: ListingCursor,
    pub listing_fields: Fields,
}

impl ItemReference {
    pub fn new(entry: ListingEntry, position: ListingCursor) -> Self {
        Self {
            natural_key: entry.natural_key,
            source_id: entry.source_id,
            position,
            listing_fields: entry.fields,
        }
    }

    pub fn page(&self) -> u64 {
        self.position.page
    }
}

/// Listing data merged with detail-page data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub natural_key: String,
    pub source_id: String,
    pub page: u64,
    pub fields: Fields,
    pub enriched_at: DateTime<Utc>,
}

/// Why a consumed listing item produced no record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipKind {
    /// Natural key already recorded earlier in the listing
    Duplicate,
    /// Listing row had no usable natural key
    MissingKey,
    /// Detail page permanently unavailable
    DetailUnavailable,
}

impl SkipKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipKind::Duplicate => "duplicate",
            SkipKind::MissingKey => "missing_key",
            SkipKind::DetailUnavailable => "detail_unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedItem {
    pub natural_key: String,
    pub kind: SkipKind,
    pub reason: String,
}

impl SkippedItem {
    pub fn new(natural_key: impl Into<String>, kind: SkipKind, reason: impl Into<String>) -> Self {
        Self {
            natural_key: natural_key.into(),
            kind,
            reason: reason.into(),
        }
    }
}
