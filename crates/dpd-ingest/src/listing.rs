//! Lazy, resumable walk over the paginated listing

use crate::error::FetchError;
use crate::retry::{retry_with_backoff, BackoffPolicy};
use crate::source::SourceClient;
use crate::types::{ItemReference, ListingCursor, ListingEntry};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Pulls listing items one at a time, fetching pages on demand.
///
/// [`ListingFetcher::cursor`] always names the next item to be returned, so
/// recording it after an item has been processed and passing it back to
/// [`ListingFetcher::new`] continues exactly after that item.
pub struct ListingFetcher {
    source: Arc<dyn SourceClient>,
    policy: BackoffPolicy,
    cursor: ListingCursor,
    page: Option<Vec<ListingEntry>>,
    total: Option<u64>,
    largest_page: usize,
    previous_head: Option<String>,
    exhausted: bool,
    pages_fetched: u64,
}

impl ListingFetcher {
    pub fn new(source: Arc<dyn SourceClient>, policy: BackoffPolicy, start: ListingCursor) -> Self {
        Self {
            source,
            policy,
            cursor: start,
            page: None,
            total: None,
            largest_page: 0,
            previous_head: None,
            exhausted: false,
            pages_fetched: 0,
        }
    }

    /// Position of the next item
    pub fn cursor(&self) -> ListingCursor {
        self.cursor
    }

    /// The next item starts a page: either the cursor points at index 0, or
    /// the item just returned was the last one of the loaded page
    pub fn page_boundary(&self) -> bool {
        self.cursor.index == 0
            || self
                .page
                .as_ref()
                .is_some_and(|page| self.cursor.index >= page.len())
    }

    /// Total advertised by the source, once a page has been seen
    pub fn total(&self) -> Option<u64> {
        self.total
    }

    pub fn pages_fetched(&self) -> u64 {
        self.pages_fetched
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Next listing item in order, or `None` once the listing is exhausted
    pub async fn next_item(&mut self) -> Result<Option<ItemReference>, FetchError> {
        loop {
            if self.exhausted {
                return Ok(None);
            }

            if self.page.is_none() {
                let entries = self.fetch_current_page().await?;
                if entries.is_empty() {
                    info!(page = self.cursor.page, "Listing exhausted");
                    self.exhausted = true;
                    return Ok(None);
                }
                self.page = Some(entries);
            }

            if let Some(entry) = self.page.as_ref().and_then(|p| p.get(self.cursor.index)) {
                let item = ItemReference::new(entry.clone(), self.cursor);
                self.cursor = self.cursor.next_item();
                return Ok(Some(item));
            }

            self.page = None;
            if self.past_advertised_total() {
                info!(page = self.cursor.page, total = ?self.total, "Reached advertised listing total");
                self.exhausted = true;
                return Ok(None);
            }
            self.cursor = self.cursor.next_page();
        }
    }

    fn past_advertised_total(&self) -> bool {
        match self.total {
            Some(total) if self.largest_page > 0 => {
                self.cursor.page.saturating_mul(self.largest_page as u64) >= total
            },
            _ => false,
        }
    }

    async fn fetch_current_page(&mut self) -> Result<Vec<ListingEntry>, FetchError> {
        let page = self.cursor.page;
        let source = Arc::clone(&self.source);
        let label = format!("listing page {page}");

        let listing = retry_with_backoff(&self.policy, &label, |_| source.fetch_page(page))
            .await
            .map_err(|e| FetchError::from_retry(page, e))?;
        self.pages_fetched += 1;

        if listing.total.is_some() {
            self.total = listing.total;
        }
        self.largest_page = self.largest_page.max(listing.entries.len());

        // Some servers answer out-of-range pages with the last page again
        let head = listing.entries.first().map(|e| e.natural_key.clone());
        if head.is_some() && head == self.previous_head {
            warn!(page, "Listing page repeats the previous page, treating as end");
            return Ok(Vec::new());
        }
        self.previous_head = head;

        debug!(page, rows = listing.entries.len(), total = ?self.total, "Fetched listing page");
        Ok(listing.entries)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::retry::Attempt;
    use crate::source::ListingPage;
    use crate::types::{Fields, ItemReference};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct PagedSource {
        pages: Vec<Vec<&'static str>>,
        total: Option<u64>,
        failures: Mutex<Vec<Attempt<ListingPage>>>,
        requested: Mutex<Vec<u64>>,
    }

    impl PagedSource {
        fn new(pages: Vec<Vec<&'static str>>) -> Self {
            Self {
                pages,
                total: None,
                failures: Mutex::new(Vec::new()),
                requested: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SourceClient for PagedSource {
        async fn fetch_page(&self, page: u64) -> Attempt<ListingPage> {
            self.requested.lock().unwrap().push(page);
            if let Some(failure) = self.failures.lock().unwrap().pop() {
                return failure;
            }
            let keys = self.pages.get(page as usize - 1).cloned().unwrap_or_default();
            Attempt::Ok(ListingPage {
                entries: keys
                    .into_iter()
                    .map(|k| ListingEntry {
                        natural_key: k.to_string(),
                        source_id: format!("detail/{k}"),
                        fields: Fields::new(),
                    })
                    .collect(),
                total: self.total,
            })
        }

        async fn fetch_detail(&self, _item: &ItemReference) -> Attempt<Fields> {
            Attempt::Ok(Fields::new())
        }
    }

    async fn drain(fetcher: &mut ListingFetcher) -> Vec<(String, ListingCursor)> {
        let mut out = Vec::new();
        while let Some(item) = fetcher.next_item().await.unwrap() {
            out.push((item.natural_key, item.position));
        }
        out
    }

    #[tokio::test]
    async fn test_walks_pages_in_order() {
        let source = Arc::new(PagedSource::new(vec![vec!["A1", "A2"], vec!["A3"]]));
        let mut fetcher = ListingFetcher::new(source.clone(), BackoffPolicy::immediate(3), ListingCursor::START);

        let items = drain(&mut fetcher).await;
        assert_eq!(
            items,
            vec![
                ("A1".to_string(), ListingCursor::new(1, 0)),
                ("A2".to_string(), ListingCursor::new(1, 1)),
                ("A3".to_string(), ListingCursor::new(2, 0)),
            ]
        );
        assert!(fetcher.is_exhausted());
        assert_eq!(*source.requested.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_page_boundary_follows_cursor() {
        let source = Arc::new(PagedSource::new(vec![vec!["A1", "A2"], vec!["A3"]]));
        let mut fetcher = ListingFetcher::new(source.clone(), BackoffPolicy::immediate(1), ListingCursor::START);
        assert!(fetcher.page_boundary());

        let mut boundaries = Vec::new();
        while let Some(item) = fetcher.next_item().await.unwrap() {
            boundaries.push((item.natural_key, fetcher.page_boundary()));
        }
        assert_eq!(
            boundaries,
            vec![
                ("A1".to_string(), false),
                ("A2".to_string(), true),
                ("A3".to_string(), true),
            ]
        );

        // Resuming mid-page is not a boundary until that page is finished
        let resumed = ListingFetcher::new(source, BackoffPolicy::immediate(1), ListingCursor::new(1, 1));
        assert!(!resumed.page_boundary());
    }

    #[tokio::test]
    async fn test_restarts_from_recorded_cursor() {
        let source = Arc::new(PagedSource::new(vec![vec!["A1", "A2"], vec!["A3", "A4"]]));
        let mut first = ListingFetcher::new(source.clone(), BackoffPolicy::immediate(1), ListingCursor::START);
        first.next_item().await.unwrap();
        first.next_item().await.unwrap();
        let saved = first.cursor();
        assert_eq!(saved, ListingCursor::new(1, 2));

        let mut resumed = ListingFetcher::new(source, BackoffPolicy::immediate(1), saved);
        let keys: Vec<String> = drain(&mut resumed).await.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["A3", "A4"]);
    }

    #[tokio::test]
    async fn test_stops_at_advertised_total() {
        let mut source = PagedSource::new(vec![vec!["A1", "A2"], vec!["A3", "A4"], vec!["A5"]]);
        source.total = Some(4);
        let source = Arc::new(source);
        let mut fetcher = ListingFetcher::new(source.clone(), BackoffPolicy::immediate(1), ListingCursor::START);

        assert_eq!(drain(&mut fetcher).await.len(), 4);
        assert_eq!(*source.requested.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_repeated_page_ends_listing() {
        let source = Arc::new(PagedSource::new(vec![vec!["A1", "A2"], vec!["A1", "A2"]]));
        let mut fetcher = ListingFetcher::new(source, BackoffPolicy::immediate(1), ListingCursor::START);
        assert_eq!(drain(&mut fetcher).await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_fatal_errors() {
        let source = PagedSource::new(vec![vec!["A1"]]);
        source
            .failures
            .lock()
            .unwrap()
            .push(Attempt::Retryable("HTTP 503".into()));
        let source = Arc::new(source);
        let mut fetcher = ListingFetcher::new(source.clone(), BackoffPolicy::default(), ListingCursor::START);
        assert_eq!(fetcher.next_item().await.unwrap().unwrap().natural_key, "A1");

        source
            .failures
            .lock()
            .unwrap()
            .push(Attempt::Fatal("results table not found".into()));
        let err = fetcher.next_item().await.unwrap_err();
        assert!(matches!(err, FetchError::Source { page: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_surface_as_transient() {
        let source = PagedSource::new(vec![vec!["A1"]]);
        {
            let mut failures = source.failures.lock().unwrap();
            for _ in 0..3 {
                failures.push(Attempt::Retryable("timeout".into()));
            }
        }
        let mut fetcher =
            ListingFetcher::new(Arc::new(source), BackoffPolicy::new(3, std::time::Duration::from_secs(1)), ListingCursor::START);
        let err = fetcher.next_item().await.unwrap_err();
        assert!(matches!(err, FetchError::Transient { page: 1, attempts: 3, .. }));
        assert_eq!(fetcher.cursor(), ListingCursor::START);
    }
}
