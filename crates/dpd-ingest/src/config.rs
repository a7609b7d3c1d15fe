//! Environment-driven configuration for scrape and sync runs

use crate::orchestrator::{ScrapeOptions, DEFAULT_BUDGET};
use crate::remote::PostgrestConfig;
use crate::retry::BackoffPolicy;
use crate::source::dpd::{DEFAULT_USER_AGENT, DPD_BASE_URL};
use crate::source::DpdClientConfig;
use crate::sync::{SyncOptions, DEFAULT_BATCH_SIZE};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_TABLE: &str = "nexara_all_source";
pub const DEFAULT_SOURCE_TAG: &str = "HC";
pub const DEFAULT_CHECKPOINT_PATH: &str = "artifacts/checkpoints/dpd_checkpoint.jsonl";

/// Everything a run needs. CLI flags override individual fields after
/// [`IngestConfig::from_env`].
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Supabase project URL; required for syncing
    pub supabase_url: Option<String>,
    pub supabase_key: Option<String>,
    pub table: String,
    /// Tag written to `source` and used as the `row_uid` prefix
    pub source_tag: String,
    pub base_url: String,
    pub user_agent: String,
    pub checkpoint_path: PathBuf,
    pub timeout_secs: u64,
    /// Attempts per HTTP request against the source, including the first
    pub retries: u32,
    pub retry_sleep_ms: u64,
    /// Pause before every source request
    pub request_sleep_ms: u64,
    /// 0 means no cap
    pub max_rows: usize,
    pub budget_secs: u64,
    pub status_interval: u64,
    /// Items between checkpoint writes (1 = after every item)
    pub checkpoint_every: u64,
    pub batch_size: usize,
    pub sync_max_retries: u32,
    pub sync_concurrency: usize,
    pub show_progress: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            supabase_url: None,
            supabase_key: None,
            table: DEFAULT_TABLE.to_string(),
            source_tag: DEFAULT_SOURCE_TAG.to_string(),
            base_url: DPD_BASE_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            checkpoint_path: PathBuf::from(DEFAULT_CHECKPOINT_PATH),
            timeout_secs: 90,
            retries: 5,
            retry_sleep_ms: 1200,
            request_sleep_ms: 80,
            max_rows: 0,
            budget_secs: DEFAULT_BUDGET.as_secs(),
            status_interval: 100,
            checkpoint_every: 1,
            batch_size: DEFAULT_BATCH_SIZE,
            sync_max_retries: 3,
            sync_concurrency: 1,
            show_progress: false,
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match env_string(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid value for {}: '{}'", name, raw)),
        None => Ok(default),
    }
}

impl IngestConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let config = Self {
            supabase_url: env_string("SUPABASE_URL"),
            supabase_key: env_string("SUPABASE_SERVICE_ROLE_KEY"),
            table: env_string("INGEST_TABLE").unwrap_or(defaults.table),
            source_tag: env_string("INGEST_SOURCE_TAG").unwrap_or(defaults.source_tag),
            base_url: env_string("DPD_BASE_URL").unwrap_or(defaults.base_url),
            user_agent: env_string("SCRAPER_USER_AGENT").unwrap_or(defaults.user_agent),
            checkpoint_path: env_string("SCRAPER_CHECKPOINT_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.checkpoint_path),
            timeout_secs: env_parse("SCRAPER_TIMEOUT_SECS", defaults.timeout_secs)?,
            retries: env_parse("SCRAPER_RETRIES", defaults.retries)?,
            retry_sleep_ms: env_parse("SCRAPER_RETRY_SLEEP_MS", defaults.retry_sleep_ms)?,
            request_sleep_ms: env_parse("SCRAPER_REQUEST_SLEEP_MS", defaults.request_sleep_ms)?,
            max_rows: env_parse("SCRAPER_MAX_ROWS", defaults.max_rows)?,
            budget_secs: env_parse("SCRAPER_BUDGET_SECS", defaults.budget_secs)?,
            status_interval: env_parse("SCRAPER_STATUS_INTERVAL", defaults.status_interval)?,
            checkpoint_every: env_parse("SCRAPER_CHECKPOINT_EVERY", defaults.checkpoint_every)?,
            batch_size: env_parse("SYNC_BATCH_SIZE", defaults.batch_size)?,
            sync_max_retries: env_parse("SYNC_MAX_RETRIES", defaults.sync_max_retries)?,
            sync_concurrency: env_parse("SYNC_CONCURRENCY", defaults.sync_concurrency)?,
            show_progress: defaults.show_progress,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.source_tag.is_empty() || self.source_tag.contains(':') {
            anyhow::bail!("INGEST_SOURCE_TAG must be non-empty and must not contain ':'");
        }
        if self.table.is_empty() {
            anyhow::bail!("INGEST_TABLE must not be empty");
        }
        if self.timeout_secs == 0 {
            anyhow::bail!("SCRAPER_TIMEOUT_SECS must be greater than 0");
        }
        if self.retries == 0 {
            anyhow::bail!("SCRAPER_RETRIES must be at least 1");
        }
        if self.budget_secs == 0 {
            anyhow::bail!("SCRAPER_BUDGET_SECS must be greater than 0");
        }
        if self.batch_size == 0 {
            anyhow::bail!("SYNC_BATCH_SIZE must be greater than 0");
        }
        if self.sync_max_retries == 0 {
            anyhow::bail!("SYNC_MAX_RETRIES must be at least 1");
        }
        if self.sync_concurrency == 0 {
            anyhow::bail!("SYNC_CONCURRENCY must be greater than 0");
        }
        Ok(())
    }

    /// Remote settings, or an error naming what is missing
    pub fn postgrest(&self) -> anyhow::Result<PostgrestConfig> {
        let url = self
            .supabase_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("SUPABASE_URL is required for syncing"))?;
        let key = self
            .supabase_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("SUPABASE_SERVICE_ROLE_KEY is required for syncing"))?;
        Ok(PostgrestConfig::new(url, key, self.table.clone()))
    }

    pub fn has_remote(&self) -> bool {
        self.supabase_url.is_some() && self.supabase_key.is_some()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn budget(&self) -> Duration {
        Duration::from_secs(self.budget_secs)
    }

    pub fn source_client(&self) -> DpdClientConfig {
        DpdClientConfig {
            base_url: self.base_url.clone(),
            timeout: self.timeout(),
            request_delay: Duration::from_millis(self.request_sleep_ms),
            user_agent: self.user_agent.clone(),
        }
    }

    pub fn scrape_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.retries, Duration::from_millis(self.retry_sleep_ms))
    }

    pub fn scrape_options(&self) -> ScrapeOptions {
        ScrapeOptions {
            budget: self.budget(),
            max_records: (self.max_rows > 0).then_some(self.max_rows),
            status_interval: self.status_interval,
            checkpoint_every: self.checkpoint_every.max(1),
            show_progress: self.show_progress,
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        let defaults = SyncOptions::default();
        SyncOptions {
            batch_size: self.batch_size,
            policy: BackoffPolicy {
                max_attempts: self.sync_max_retries,
                ..defaults.policy
            },
            concurrency: self.sync_concurrency,
            show_progress: self.show_progress,
        }
    }
}
