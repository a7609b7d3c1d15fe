//! Scrape loop: listing -> enrichment -> checkpoint, under a wall-clock budget
//!
//! ```text
//! Idle -> Running -> Completed        listing exhausted or record limit hit
//!                 -> BudgetExceeded   budget spent or stop requested
//!                 -> FatalError       source unusable, retries exhausted,
//!                                     or checkpoint write failed
//! ```
//!
//! Every terminal state leaves a valid checkpoint on disk. `BudgetExceeded`
//! and transient `FatalError`s resume from it on the next run.

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::detail::DetailEnricher;
use crate::error::{CheckpointError, EnrichError, ErrorClass, FetchError};
use crate::listing::ListingFetcher;
use crate::progress::{create_run_progress, set_total};
use crate::retry::BackoffPolicy;
use crate::source::SourceClient;
use crate::types::{SkipKind, SkippedItem};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 5.5 hours, leaving room inside a 6 hour job limit for the sync phase
pub const DEFAULT_BUDGET: Duration = Duration::from_secs(19_800);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeState {
    Idle,
    Running,
    Completed,
    BudgetExceeded,
    FatalError,
}

impl ScrapeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrapeState::Idle => "idle",
            ScrapeState::Running => "running",
            ScrapeState::Completed => "completed",
            ScrapeState::BudgetExceeded => "budget_exceeded",
            ScrapeState::FatalError => "fatal_error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScrapeState::Completed | ScrapeState::BudgetExceeded | ScrapeState::FatalError
        )
    }
}

impl std::fmt::Display for ScrapeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run stopped without failing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    ListingExhausted,
    RecordLimit,
    Budget,
    StopRequested,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeFailure {
    pub class: ErrorClass,
    pub message: String,
}

impl From<&StepError> for ScrapeFailure {
    fn from(err: &StepError) -> Self {
        let class = match err {
            StepError::Fetch(e) => e.class(),
            StepError::Enrich(e) => e.class(),
            StepError::Checkpoint(e) => e.class(),
        };
        Self {
            class,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Enrich(#[from] EnrichError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Result of processing one listing item
#[derive(Debug)]
pub enum StepOutcome {
    Recorded,
    Skipped(SkipKind),
    /// No items left in the listing
    Exhausted,
    Failed(StepError),
}

#[derive(Debug, Clone)]
pub struct ScrapeOptions {
    pub budget: Duration,
    /// Stop as completed once this many records are held
    pub max_records: Option<usize>,
    /// Log a progress line every N items; 0 disables
    pub status_interval: u64,
    /// Persist after every N consumed items; page ends and exits always
    /// persist
    pub checkpoint_every: u64,
    pub show_progress: bool,
}

impl Default for ScrapeOptions {
    fn default() -> Self {
        Self {
            budget: DEFAULT_BUDGET,
            max_records: None,
            status_interval: 100,
            checkpoint_every: 1,
            show_progress: false,
        }
    }
}

/// How to treat an existing checkpoint at startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeMode {
    /// Ignore whatever is on disk
    pub fresh: bool,
    /// Move a corrupt checkpoint aside instead of failing
    pub discard_corrupt: bool,
}

#[derive(Debug)]
pub struct ScrapeOutcome {
    pub state: ScrapeState,
    pub stop: Option<StopReason>,
    pub failure: Option<ScrapeFailure>,
    pub checkpoint: Checkpoint,
    pub recorded: u64,
    pub skipped: u64,
    pub elapsed: Duration,
}

impl ScrapeOutcome {
    /// A later run can pick up where this one stopped
    pub fn is_resumable(&self) -> bool {
        match self.state {
            ScrapeState::BudgetExceeded => true,
            ScrapeState::FatalError => self
                .failure
                .as_ref()
                .is_some_and(|f| f.class == ErrorClass::Transient),
            _ => false,
        }
    }
}

pub struct ScrapeOrchestrator {
    source: Arc<dyn SourceClient>,
    store: CheckpointStore,
    enricher: DetailEnricher,
    policy: BackoffPolicy,
    options: ScrapeOptions,
    cancel: CancellationToken,
    state: ScrapeState,
    seen: HashSet<String>,
}

impl ScrapeOrchestrator {
    pub fn new(
        source: Arc<dyn SourceClient>,
        store: CheckpointStore,
        policy: BackoffPolicy,
        options: ScrapeOptions,
        cancel: CancellationToken,
    ) -> Self {
        let enricher = DetailEnricher::new(Arc::clone(&source), policy.clone());
        Self {
            source,
            store,
            enricher,
            policy,
            options,
            cancel,
            state: ScrapeState::Idle,
            seen: HashSet::new(),
        }
    }

    pub fn state(&self) -> ScrapeState {
        self.state
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    fn transition(&mut self, to: ScrapeState) {
        if self.state != to {
            debug!(from = %self.state, to = %to, "Scrape state change");
            self.state = to;
        }
    }

    /// Checkpoint to start from: the stored one when resumable, otherwise
    /// an empty one for `source_tag`.
    pub async fn initial_checkpoint(
        &self,
        source_tag: &str,
        mode: ResumeMode,
    ) -> Result<Checkpoint, CheckpointError> {
        if mode.fresh {
            info!(path = %self.store.path().display(), "Fresh start requested, ignoring stored checkpoint");
            return Ok(Checkpoint::empty(source_tag));
        }

        match self.store.load().await {
            Ok(Some(cp)) if cp.source != source_tag => Err(CheckpointError::Corrupt {
                path: self.store.path().to_path_buf(),
                reason: format!("holds records for source '{}', expected '{source_tag}'", cp.source),
            }),
            Ok(Some(cp)) if cp.completed => {
                info!(
                    run_id = %cp.run_id,
                    records = cp.records.len(),
                    "Previous snapshot completed, starting a new one"
                );
                Ok(Checkpoint::empty(source_tag))
            },
            Ok(Some(cp)) => {
                info!(
                    run_id = %cp.run_id,
                    cursor = %cp.cursor,
                    records = cp.records.len(),
                    "Resuming from checkpoint"
                );
                Ok(cp)
            },
            Ok(None) => Ok(Checkpoint::empty(source_tag)),
            Err(e) if e.is_corrupt() && mode.discard_corrupt => {
                warn!(error = %e, "Discarding corrupt checkpoint and starting over");
                self.store.discard().await?;
                Ok(Checkpoint::empty(source_tag))
            },
            Err(e) => Err(e),
        }
    }

    async fn persist(&self, checkpoint: &mut Checkpoint, page_end: bool) -> Result<(), CheckpointError> {
        if page_end || checkpoint.unsaved() as u64 >= self.options.checkpoint_every.max(1) {
            self.store.save(checkpoint).await?;
        }
        Ok(())
    }

    /// Pull one item, enrich it, and fold it into `checkpoint`.
    ///
    /// The checkpoint is handed back in every case; after a failure it still
    /// describes the last item that was fully processed.
    pub async fn step(
        &mut self,
        mut checkpoint: Checkpoint,
        listing: &mut ListingFetcher,
    ) -> (Checkpoint, StepOutcome) {
        let item = match listing.next_item().await {
            Ok(Some(item)) => item,
            Ok(None) => return (checkpoint, StepOutcome::Exhausted),
            Err(e) => return (checkpoint, StepOutcome::Failed(e.into())),
        };
        let cursor = listing.cursor();

        let outcome = if item.natural_key.is_empty() {
            warn!(position = %item.position, "Listing row has no natural key, skipping");
            checkpoint.push_skipped(
                SkippedItem::new("", SkipKind::MissingKey, format!("no key at {}", item.position)),
                cursor,
            );
            StepOutcome::Skipped(SkipKind::MissingKey)
        } else if self.seen.contains(&item.natural_key) {
            debug!(key = %item.natural_key, position = %item.position, "Duplicate listing entry");
            checkpoint.push_skipped(
                SkippedItem::new(
                    item.natural_key.clone(),
                    SkipKind::Duplicate,
                    format!("already seen, repeated at {}", item.position),
                ),
                cursor,
            );
            StepOutcome::Skipped(SkipKind::Duplicate)
        } else {
            match self.enricher.enrich(&item).await {
                Ok(record) => {
                    self.seen.insert(item.natural_key.clone());
                    checkpoint.push_record(record, cursor);
                    StepOutcome::Recorded
                },
                Err(err @ EnrichError::Permanent { .. }) => {
                    warn!(key = %item.natural_key, error = %err, "Detail unavailable, skipping item");
                    self.seen.insert(item.natural_key.clone());
                    checkpoint.push_skipped(
                        SkippedItem::new(item.natural_key.clone(), SkipKind::DetailUnavailable, err.to_string()),
                        cursor,
                    );
                    StepOutcome::Skipped(SkipKind::DetailUnavailable)
                },
                Err(err) => return (checkpoint, StepOutcome::Failed(err.into())),
            }
        };

        if let Err(e) = self.persist(&mut checkpoint, listing.page_boundary()).await {
            return (checkpoint, StepOutcome::Failed(e.into()));
        }
        (checkpoint, outcome)
    }

    /// Run until a terminal state, starting from `checkpoint`
    pub async fn run(&mut self, checkpoint: Checkpoint) -> ScrapeOutcome {
        let started = Instant::now();
        self.transition(ScrapeState::Running);
        self.seen = checkpoint
            .records
            .iter()
            .map(|r| r.natural_key.clone())
            .chain(checkpoint.skipped.iter().map(|s| s.natural_key.clone()))
            .filter(|k| !k.is_empty())
            .collect();

        let mut listing =
            ListingFetcher::new(Arc::clone(&self.source), self.policy.clone(), checkpoint.cursor);
        let pb = create_run_progress(self.options.show_progress, "Scraping DPD listing");
        pb.set_position(checkpoint.consumed);

        info!(
            run_id = %checkpoint.run_id,
            cursor = %checkpoint.cursor,
            records = checkpoint.records.len(),
            budget_secs = self.options.budget.as_secs(),
            "Scrape started"
        );

        let mut checkpoint = checkpoint;
        let mut recorded = 0u64;
        let mut skipped = 0u64;

        let (mut state, stop, mut failure) = loop {
            if let Some(limit) = self.options.max_records {
                if checkpoint.records.len() >= limit {
                    info!(limit, "Record limit reached");
                    break (ScrapeState::Completed, Some(StopReason::RecordLimit), None);
                }
            }
            if self.cancel.is_cancelled() {
                warn!("Stop requested, ending scrape");
                break (ScrapeState::BudgetExceeded, Some(StopReason::StopRequested), None);
            }
            if started.elapsed() >= self.options.budget {
                warn!(elapsed_secs = started.elapsed().as_secs(), "Scrape budget exhausted");
                break (ScrapeState::BudgetExceeded, Some(StopReason::Budget), None);
            }

            let (next, outcome) = self.step(checkpoint, &mut listing).await;
            checkpoint = next;
            match outcome {
                StepOutcome::Recorded => recorded += 1,
                StepOutcome::Skipped(_) => skipped += 1,
                StepOutcome::Exhausted => {
                    break (ScrapeState::Completed, Some(StopReason::ListingExhausted), None)
                },
                StepOutcome::Failed(err) => {
                    let failure = ScrapeFailure::from(&err);
                    error!(class = %failure.class, error = %err, "Scrape failed");
                    break (ScrapeState::FatalError, None, Some(failure));
                },
            }

            pb.inc(1);
            if let Some(total) = listing.total() {
                set_total(&pb, total);
            }
            let processed = recorded + skipped;
            if self.options.status_interval > 0 && processed % self.options.status_interval == 0 {
                info!(
                    processed,
                    records = checkpoint.records.len(),
                    skipped = checkpoint.skipped.len(),
                    cursor = %checkpoint.cursor,
                    total = ?listing.total(),
                    elapsed_secs = started.elapsed().as_secs(),
                    "Scrape progress"
                );
            }
        };

        if state == ScrapeState::Completed {
            checkpoint.complete();
        }
        if checkpoint.unsaved() > 0 {
            if let Err(e) = self.store.save(&mut checkpoint).await {
                error!(error = %e, "Final checkpoint write failed");
                failure = Some(ScrapeFailure {
                    class: e.class(),
                    message: e.to_string(),
                });
                state = ScrapeState::FatalError;
            }
        }

        pb.finish_and_clear();
        self.transition(state);

        let elapsed = started.elapsed();
        info!(
            state = %state,
            recorded,
            skipped,
            total_records = checkpoint.records.len(),
            elapsed_secs = elapsed.as_secs(),
            "Scrape finished"
        );

        ScrapeOutcome {
            state,
            stop,
            failure,
            checkpoint,
            recorded,
            skipped,
            elapsed,
        }
    }
}
