//! Batched insert-only writer with per-batch retry and failure isolation
//!
//! Rows are split into fixed-size batches in input order. Each batch gets its
//! own retry budget; a batch that still fails is recorded and the writer moves
//! on. A uniqueness conflict means some rows are already stored (another run
//! got there first), so the batch is replayed row by row and conflicting rows
//! are counted as already present.

use crate::error::RemoteError;
use crate::mapper::MappedRow;
use crate::progress::create_progress_bar;
use crate::remote::RemoteStore;
use crate::retry::{retry_with_backoff, Attempt, BackoffPolicy, RetryError};
use futures::stream::{self, StreamExt};
use indicatif::ProgressBar;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const DEFAULT_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub batch_size: usize,
    pub policy: BackoffPolicy,
    /// Batches in flight at once; results are still reported in order
    pub concurrency: usize,
    pub show_progress: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            policy: BackoffPolicy {
                max_attempts: 3,
                base_delay: Duration::from_secs(2),
                multiplier: 2,
                max_delay: Duration::from_secs(30),
            },
            concurrency: 1,
            show_progress: false,
        }
    }
}

/// A batch (or the rows of it) that could not be delivered
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFailure {
    pub batch_index: usize,
    pub row_uids: Vec<String>,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub batches: usize,
    pub inserted: usize,
    pub already_present: usize,
    pub failed_batches: Vec<BatchFailure>,
}

impl SyncReport {
    pub fn failed_rows(&self) -> usize {
        self.failed_batches.iter().map(|f| f.row_uids.len()).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.failed_batches.is_empty()
    }
}

#[derive(Debug, Default)]
struct BatchOutcome {
    inserted: usize,
    already_present: usize,
    failure: Option<BatchFailure>,
}

/// What one insert call achieved, once retries are settled
enum Write {
    Inserted,
    Conflict,
}

pub struct SyncWriter {
    store: Arc<dyn RemoteStore>,
    options: SyncOptions,
}

impl SyncWriter {
    pub fn new(store: Arc<dyn RemoteStore>, options: SyncOptions) -> Self {
        Self { store, options }
    }

    /// Insert `rows` batch by batch. Never fails as a whole; undelivered
    /// batches are listed in the report.
    pub async fn sync(&self, rows: Vec<MappedRow>) -> SyncReport {
        let batch_size = self.options.batch_size.max(1);
        let batches: Vec<&[MappedRow]> = rows.chunks(batch_size).collect();
        let pb = create_progress_bar(self.options.show_progress, rows.len() as u64, "Syncing rows");

        info!(rows = rows.len(), batches = batches.len(), batch_size, "Sync started");

        let outcomes: Vec<BatchOutcome> = stream::iter(
            batches
                .iter()
                .enumerate()
                .map(|(index, batch)| self.write_batch(index, batch, &pb)),
        )
        .buffered(self.options.concurrency.max(1))
        .collect()
        .await;
        pb.finish_and_clear();

        let mut report = SyncReport {
            batches: batches.len(),
            ..SyncReport::default()
        };
        for outcome in outcomes {
            report.inserted += outcome.inserted;
            report.already_present += outcome.already_present;
            report.failed_batches.extend(outcome.failure);
        }

        info!(
            inserted = report.inserted,
            already_present = report.already_present,
            failed_batches = report.failed_batches.len(),
            failed_rows = report.failed_rows(),
            "Sync finished"
        );
        report
    }

    async fn insert_with_retry(&self, label: &str, rows: &[MappedRow]) -> Result<Write, RetryError> {
        retry_with_backoff(&self.options.policy, label, |_| async move {
            match self.store.insert_rows(rows).await {
                Ok(()) => Attempt::Ok(Write::Inserted),
                Err(RemoteError::Conflict(_)) => Attempt::Ok(Write::Conflict),
                Err(e) => e.into_attempt(),
            }
        })
        .await
    }

    async fn write_batch(&self, index: usize, batch: &[MappedRow], pb: &ProgressBar) -> BatchOutcome {
        let label = format!("sync batch {index}");
        let outcome = match self.insert_with_retry(&label, batch).await {
            Ok(Write::Inserted) => {
                debug!(batch = index, rows = batch.len(), "Batch inserted");
                BatchOutcome {
                    inserted: batch.len(),
                    ..BatchOutcome::default()
                }
            },
            Ok(Write::Conflict) => {
                warn!(batch = index, rows = batch.len(), "Batch hit existing rows, inserting row by row");
                self.write_rows(index, batch).await
            },
            Err(e) => {
                error!(batch = index, rows = batch.len(), error = %e, "Batch failed");
                BatchOutcome {
                    failure: Some(BatchFailure {
                        batch_index: index,
                        row_uids: batch.iter().map(|r| r.row_uid.clone()).collect(),
                        error: e.to_string(),
                    }),
                    ..BatchOutcome::default()
                }
            },
        };
        pb.inc(batch.len() as u64);
        outcome
    }

    async fn write_rows(&self, index: usize, batch: &[MappedRow]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let mut failed = Vec::new();
        let mut last_error = String::new();

        for row in batch {
            let label = format!("sync batch {index} row {}", row.row_uid);
            match self.insert_with_retry(&label, std::slice::from_ref(row)).await {
                Ok(Write::Inserted) => outcome.inserted += 1,
                Ok(Write::Conflict) => outcome.already_present += 1,
                Err(e) => {
                    error!(batch = index, row_uid = %row.row_uid, error = %e, "Row failed");
                    failed.push(row.row_uid.clone());
                    last_error = e.to_string();
                },
            }
        }

        if !failed.is_empty() {
            outcome.failure = Some(BatchFailure {
                batch_index: index,
                row_uids: failed,
                error: last_error,
            });
        }
        outcome
    }
}
