//! Source collaborator: where listing pages and detail pages come from

pub mod dpd;

use crate::retry::Attempt;
use crate::types::{Fields, ItemReference, ListingEntry};
use async_trait::async_trait;
use reqwest::StatusCode;

pub use dpd::{DpdClientConfig, DpdSourceClient};

/// One page of the paginated listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingPage {
    pub entries: Vec<ListingEntry>,
    /// Total entry count advertised by the source, when it shows one
    pub total: Option<u64>,
}

impl ListingPage {
    pub fn new(entries: Vec<ListingEntry>) -> Self {
        Self {
            entries,
            total: None,
        }
    }
}

/// Paginated listing plus per-item detail lookups.
///
/// Implementations classify every call as [`Attempt::Ok`],
/// [`Attempt::Retryable`] or [`Attempt::Fatal`]; retrying is the caller's job.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Fetch listing page `page` (1-based). An empty page ends the listing.
    async fn fetch_page(&self, page: u64) -> Attempt<ListingPage>;

    /// Fetch the detail columns for one listing item
    async fn fetch_detail(&self, item: &ItemReference) -> Attempt<Fields>;

    /// Column values every record starts from before listing and detail
    /// data are merged in
    fn default_fields(&self) -> Fields {
        Fields::new()
    }
}

/// Map a non-success HTTP status to an attempt outcome
pub(crate) fn classify_status<T>(status: StatusCode) -> Option<Attempt<T>> {
    if status.is_success() {
        return None;
    }
    let reason = format!("HTTP {status}");
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Some(Attempt::Refused(reason));
    }
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        Some(Attempt::Retryable(reason))
    } else {
        Some(Attempt::Fatal(reason))
    }
}

/// Transport failures (timeouts, resets, DNS) are all worth retrying
pub(crate) fn describe_transport(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("request timed out: {err}")
    } else if err.is_connect() {
        format!("connection failed: {err}")
    } else {
        format!("request failed: {err}")
    }
}
