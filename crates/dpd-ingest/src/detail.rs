//! Detail enrichment: listing item + detail page -> [`EnrichedRecord`]

use crate::error::EnrichError;
use crate::retry::{retry_with_backoff, BackoffPolicy};
use crate::source::SourceClient;
use crate::types::{EnrichedRecord, Fields, ItemReference};
use chrono::Utc;
use dpd_common::text::normalize_newlines;
use std::sync::Arc;
use tracing::debug;

pub struct DetailEnricher {
    source: Arc<dyn SourceClient>,
    policy: BackoffPolicy,
}

impl DetailEnricher {
    pub fn new(source: Arc<dyn SourceClient>, policy: BackoffPolicy) -> Self {
        Self { source, policy }
    }

    /// Fetch the detail page for `item` and merge it with the listing data.
    ///
    /// Items without a detail link are recorded from listing data alone.
    pub async fn enrich(&self, item: &ItemReference) -> Result<EnrichedRecord, EnrichError> {
        let detail = if item.source_id.is_empty() {
            debug!(key = %item.natural_key, "No detail link, using listing data only");
            Fields::new()
        } else {
            let label = format!("detail {}", item.natural_key);
            retry_with_backoff(&self.policy, &label, |_| self.source.fetch_detail(item))
                .await
                .map_err(|e| EnrichError::from_retry(&item.natural_key, e))?
        };

        Ok(EnrichedRecord {
            natural_key: item.natural_key.clone(),
            source_id: item.source_id.clone(),
            page: item.page(),
            fields: merge_fields(self.source.default_fields(), &item.listing_fields, &detail),
            enriched_at: Utc::now(),
        })
    }
}

/// Layer listing values over the defaults, then non-empty detail values over
/// both. Line endings are normalized to `\n`.
pub fn merge_fields(defaults: Fields, listing: &Fields, detail: &Fields) -> Fields {
    let mut merged = defaults;
    for (column, value) in listing {
        merged.insert(column.clone(), value.clone());
    }
    for (column, value) in detail {
        if !value.trim().is_empty() {
            merged.insert(column.clone(), value.clone());
        }
    }
    for value in merged.values_mut() {
        if value.contains('\r') {
            *value = normalize_newlines(value);
        }
    }
    merged
}
