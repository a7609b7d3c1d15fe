//! Scrape and sync wiring
//!
//! [`Pipeline`] owns the collaborators (source, remote store, checkpoint
//! store) and runs one of three modes:
//!
//! - [`RunMode::Full`]: scrape (resuming if possible), then sync whatever the
//!   checkpoint holds, even after a failed scrape
//! - [`RunMode::ScrapeOnly`]: scrape into the checkpoint and stop
//! - [`RunMode::SyncOnly`]: sync the stored checkpoint without scraping
//!
//! Only checkpoint corruption keeps collected records from being synced.

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::IngestConfig;
use crate::dedup::{drop_repeated, filter_with_summary, DedupSummary};
use crate::error::{CheckpointError, ErrorClass, IngestError, RemoteError};
use crate::mapper::map_records;
use crate::orchestrator::{ResumeMode, ScrapeOptions, ScrapeOrchestrator, ScrapeOutcome};
use crate::remote::{PostgrestStore, RemoteStore};
use crate::retry::{retry_with_backoff, Attempt, BackoffPolicy, RetryError};
use crate::source::{DpdSourceClient, SourceClient};
use crate::sync::{SyncOptions, SyncReport, SyncWriter};
use crate::types::EnrichedRecord;
use crate::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Full,
    ScrapeOnly,
    SyncOnly,
}

impl RunMode {
    fn syncs(self) -> bool {
        !matches!(self, RunMode::ScrapeOnly)
    }

    fn scrapes(self) -> bool {
        !matches!(self, RunMode::SyncOnly)
    }
}

#[derive(Debug, Default)]
pub struct PipelineReport {
    pub scrape: Option<ScrapeOutcome>,
    pub dedup: Option<DedupSummary>,
    pub sync: Option<SyncReport>,
}

impl PipelineReport {
    /// Scrape ended without a failure and every batch was delivered
    pub fn is_success(&self) -> bool {
        let scrape_ok = self.scrape.as_ref().map_or(true, |s| s.failure.is_none());
        let sync_ok = self.sync.as_ref().map_or(true, SyncReport::is_clean);
        scrape_ok && sync_ok
    }

    pub fn failure_class(&self) -> Option<ErrorClass> {
        self.scrape
            .as_ref()
            .and_then(|s| s.failure.as_ref())
            .map(|f| f.class)
            .or_else(|| {
                self.sync
                    .as_ref()
                    .filter(|s| !s.is_clean())
                    .map(|_| ErrorClass::BatchFailure)
            })
    }
}

pub struct Pipeline {
    source: Arc<dyn SourceClient>,
    remote: Option<Arc<dyn RemoteStore>>,
    store: CheckpointStore,
    source_tag: String,
    scrape_policy: BackoffPolicy,
    scrape_options: ScrapeOptions,
    sync_options: SyncOptions,
    resume: ResumeMode,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn SourceClient>,
        remote: Option<Arc<dyn RemoteStore>>,
        store: CheckpointStore,
        source_tag: impl Into<String>,
    ) -> Self {
        Self {
            source,
            remote,
            store,
            source_tag: source_tag.into(),
            scrape_policy: BackoffPolicy::default(),
            scrape_options: ScrapeOptions::default(),
            sync_options: SyncOptions::default(),
            resume: ResumeMode::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Build the DPD client and, when credentials are set, the PostgREST store
    pub fn from_config(config: &IngestConfig) -> Result<Self> {
        let source = Arc::new(DpdSourceClient::new(config.source_client())?);
        let remote: Option<Arc<dyn RemoteStore>> = if config.has_remote() {
            let remote_config = config
                .postgrest()
                .map_err(|e| IngestError::Config(e.to_string()))?;
            Some(Arc::new(PostgrestStore::new(remote_config)?))
        } else {
            None
        };

        Ok(Self::new(
            source,
            remote,
            CheckpointStore::new(config.checkpoint_path.clone()),
            config.source_tag.clone(),
        )
        .with_scrape_policy(config.scrape_policy())
        .with_scrape_options(config.scrape_options())
        .with_sync_options(config.sync_options()))
    }

    pub fn with_scrape_policy(mut self, policy: BackoffPolicy) -> Self {
        self.scrape_policy = policy;
        self
    }

    pub fn with_scrape_options(mut self, options: ScrapeOptions) -> Self {
        self.scrape_options = options;
        self
    }

    pub fn with_sync_options(mut self, options: SyncOptions) -> Self {
        self.sync_options = options;
        self
    }

    pub fn with_resume(mut self, resume: ResumeMode) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    fn remote(&self) -> Result<Arc<dyn RemoteStore>> {
        self.remote.clone().ok_or_else(|| {
            IngestError::Config("syncing needs SUPABASE_URL and SUPABASE_SERVICE_ROLE_KEY".into())
        })
    }

    pub async fn run(&self, mode: RunMode) -> Result<PipelineReport> {
        if mode.syncs() {
            self.remote()?;
        }

        let mut report = PipelineReport::default();
        let records = if mode.scrapes() {
            let outcome = self.scrape().await?;
            let corrupt = outcome
                .failure
                .as_ref()
                .is_some_and(|f| f.class == ErrorClass::Corruption);
            let records = (!corrupt).then(|| outcome.checkpoint.records.clone());
            if corrupt {
                warn!("Checkpoint is corrupt, not syncing scraped records");
            }
            report.scrape = Some(outcome);
            records
        } else {
            Some(self.load_for_sync().await?.records)
        };

        if let (true, Some(records)) = (mode.syncs(), records) {
            let (dedup, sync) = self.sync_records(&records).await?;
            report.dedup = Some(dedup);
            report.sync = Some(sync);
        }
        Ok(report)
    }

    /// Run the scrape state machine from the stored (or a fresh) checkpoint
    pub async fn scrape(&self) -> Result<ScrapeOutcome> {
        let mut orchestrator = ScrapeOrchestrator::new(
            Arc::clone(&self.source),
            self.store.clone(),
            self.scrape_policy.clone(),
            self.scrape_options.clone(),
            self.cancel.clone(),
        );
        let checkpoint = orchestrator
            .initial_checkpoint(&self.source_tag, self.resume)
            .await?;
        let outcome = orchestrator.run(checkpoint).await;

        info!(
            state = %outcome.state,
            stop = ?outcome.stop,
            recorded = outcome.recorded,
            skipped = outcome.skipped,
            held = outcome.checkpoint.records.len(),
            elapsed_secs = outcome.elapsed.as_secs(),
            "Scrape finished"
        );
        Ok(outcome)
    }

    async fn load_for_sync(&self) -> Result<Checkpoint> {
        let loaded = match self.store.load().await {
            Ok(Some(cp)) if cp.source != self.source_tag => Err(CheckpointError::Corrupt {
                path: self.store.path().to_path_buf(),
                reason: format!("holds records for source '{}', expected '{}'", cp.source, self.source_tag),
            }),
            other => other,
        };

        match loaded {
            Ok(Some(cp)) => Ok(cp),
            Ok(None) => {
                warn!(path = %self.store.path().display(), "No checkpoint to sync");
                Ok(Checkpoint::empty(&self.source_tag))
            },
            Err(e) if e.is_corrupt() && self.resume.discard_corrupt => {
                warn!(error = %e, "Discarding corrupt checkpoint, nothing to sync");
                self.store.discard().await?;
                Ok(Checkpoint::empty(&self.source_tag))
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Map `records`, drop rows the remote already has, insert the rest
    pub async fn sync_records(&self, records: &[EnrichedRecord]) -> Result<(DedupSummary, SyncReport)> {
        let remote = self.remote()?;
        let rows = map_records(&self.source_tag, records);
        if rows.is_empty() {
            info!("No records to sync");
            return Ok((DedupSummary::default(), SyncReport::default()));
        }

        let existing = retry_with_backoff(&self.sync_options.policy, "fetch existing row_uids", |_| {
            let remote = Arc::clone(&remote);
            let source = self.source_tag.clone();
            async move {
                match remote.fetch_row_uids(&source).await {
                    Ok(uids) => Attempt::Ok(uids),
                    Err(e) => e.into_attempt(),
                }
            }
        })
        .await
        .map_err(|e| {
            IngestError::RemoteSnapshot(match e {
                RetryError::Exhausted { last, .. } => RemoteError::Transient(last),
                RetryError::Fatal(reason) | RetryError::Refused(reason) => RemoteError::Rejected(reason),
            })
        })?;

        let (rows, repeated) = drop_repeated(rows);
        if repeated > 0 {
            warn!(repeated, "Dropped rows repeating a row_uid");
        }
        let (rows, dedup) = filter_with_summary(rows, &existing);
        info!(
            candidates = dedup.candidates,
            already_present = dedup.already_present,
            to_insert = dedup.to_insert,
            remote_rows = existing.len(),
            "Deduplicated against remote"
        );

        let report = SyncWriter::new(remote, self.sync_options.clone()).sync(rows).await;
        Ok((dedup, report))
    }
}
