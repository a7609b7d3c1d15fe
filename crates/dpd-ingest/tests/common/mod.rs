//! Shared fakes for dpd-ingest integration tests
//!
//! - [`StaticSource`]: an in-memory paginated listing with scriptable detail
//!   failures
//! - [`MemoryTable`]: a unique-keyed remote table with scriptable failures

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use dpd_ingest::checkpoint::CheckpointStore;
use dpd_ingest::error::RemoteError;
use dpd_ingest::mapper::MappedRow;
use dpd_ingest::pipeline::Pipeline;
use dpd_ingest::remote::RemoteStore;
use dpd_ingest::retry::{Attempt, BackoffPolicy};
use dpd_ingest::source::{ListingPage, SourceClient};
use dpd_ingest::sync::SyncOptions;
use dpd_ingest::types::{Fields, ItemReference, ListingEntry};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const SOURCE_TAG: &str = "HC";

/// Listing of fixed keys split into pages of `page_size`
pub struct StaticSource {
    pages: Vec<Vec<ListingEntry>>,
    total: u64,
    detail_calls: AtomicUsize,
    /// Detail lookups from this call number on fail transiently
    fail_from_call: Option<usize>,
    /// Keys whose detail page is gone for good
    missing: HashSet<String>,
}

impl StaticSource {
    pub fn new(keys: &[&str], page_size: usize) -> Self {
        let entries: Vec<ListingEntry> = keys
            .iter()
            .map(|key| {
                let mut fields = Fields::new();
                fields.insert("DIN".to_string(), (*key).to_string());
                fields.insert("Product".to_string(), format!("PRODUCT {key}"));
                ListingEntry {
                    natural_key: (*key).to_string(),
                    source_id: format!("detail/{key}"),
                    fields,
                }
            })
            .collect();
        Self {
            pages: entries.chunks(page_size.max(1)).map(<[ListingEntry]>::to_vec).collect(),
            total: keys.len() as u64,
            detail_calls: AtomicUsize::new(0),
            fail_from_call: None,
            missing: HashSet::new(),
        }
    }

    /// Let the first `n` detail lookups succeed, then fail every later one
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_from_call = Some(n);
        self
    }

    pub fn with_missing_detail(mut self, key: &str) -> Self {
        self.missing.insert(key.to_string());
        self
    }

    pub fn detail_calls(&self) -> usize {
        self.detail_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceClient for StaticSource {
    async fn fetch_page(&self, page: u64) -> Attempt<ListingPage> {
        let entries = self
            .pages
            .get((page as usize).saturating_sub(1))
            .cloned()
            .unwrap_or_default();
        Attempt::Ok(ListingPage {
            entries,
            total: Some(self.total),
        })
    }

    async fn fetch_detail(&self, item: &ItemReference) -> Attempt<Fields> {
        let call = self.detail_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_from_call.is_some_and(|n| call >= n) {
            return Attempt::Retryable("HTTP 503 Service Unavailable".into());
        }
        if self.missing.contains(&item.natural_key) {
            return Attempt::Fatal("HTTP 404 Not Found".into());
        }
        let mut fields = Fields::new();
        fields.insert("Company".to_string(), "ACME PHARMA INC".to_string());
        fields.insert("Class".to_string(), "Human".to_string());
        Attempt::Ok(fields)
    }
}

/// Remote table with a unique `row_uid` constraint
#[derive(Default)]
pub struct MemoryTable {
    rows: Mutex<Vec<MappedRow>>,
    /// Inserts containing any of these uids fail transiently
    poisoned: Mutex<HashSet<String>>,
    insert_calls: AtomicUsize,
}

impl MemoryTable {
    pub fn with_uids(uids: &[&str]) -> Self {
        let table = Self::default();
        table.rows.lock().unwrap().extend(uids.iter().map(|uid| MappedRow {
            row_uid: (*uid).to_string(),
            source: SOURCE_TAG.to_string(),
            match_bucket: SOURCE_TAG.to_string(),
            payload: serde_json::Map::new(),
        }));
        table
    }

    pub fn poison(&self, uid: &str) {
        self.poisoned.lock().unwrap().insert(uid.to_string());
    }

    pub fn uids(&self) -> Vec<String> {
        self.rows.lock().unwrap().iter().map(|r| r.row_uid.clone()).collect()
    }

    pub fn uid_set(&self) -> HashSet<String> {
        self.uids().into_iter().collect()
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteStore for MemoryTable {
    async fn fetch_row_uids(&self, source: &str) -> Result<HashSet<String>, RemoteError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.source == source)
            .map(|r| r.row_uid.clone())
            .collect())
    }

    async fn insert_rows(&self, rows: &[MappedRow]) -> Result<(), RemoteError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        {
            let poisoned = self.poisoned.lock().unwrap();
            if rows.iter().any(|r| poisoned.contains(&r.row_uid)) {
                return Err(RemoteError::Transient("HTTP 503: upstream timeout".into()));
            }
        }
        let mut stored = self.rows.lock().unwrap();
        if rows.iter().any(|r| stored.iter().any(|s| s.row_uid == r.row_uid)) {
            return Err(RemoteError::Conflict(
                "HTTP 409: duplicate key value violates unique constraint (23505)".into(),
            ));
        }
        stored.extend(rows.iter().cloned());
        Ok(())
    }
}

/// Pipeline over the fakes with retries that never sleep
pub fn pipeline(
    source: Arc<StaticSource>,
    table: Option<Arc<MemoryTable>>,
    checkpoint: &Path,
    batch_size: usize,
) -> Pipeline {
    let remote = table.map(|t| t as Arc<dyn RemoteStore>);
    Pipeline::new(source, remote, CheckpointStore::new(checkpoint), SOURCE_TAG)
        .with_scrape_policy(BackoffPolicy::immediate(2))
        .with_sync_options(SyncOptions {
            batch_size,
            policy: BackoffPolicy::immediate(3),
            ..SyncOptions::default()
        })
}

pub fn keys(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("K{i:02}")).collect()
}

pub fn as_strs(keys: &[String]) -> Vec<&str> {
    keys.iter().map(String::as_str).collect()
}
