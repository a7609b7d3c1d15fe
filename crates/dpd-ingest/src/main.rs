//! DPD Ingest - scrape the Drug Product Database and sync it to Supabase

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use dpd_common::logging::{init_logging, LogConfig, LogLevel};
use dpd_ingest::checkpoint::CheckpointStore;
use dpd_ingest::config::IngestConfig;
use dpd_ingest::error::ErrorClass;
use dpd_ingest::orchestrator::{ResumeMode, StopReason};
use dpd_ingest::pipeline::{Pipeline, PipelineReport, RunMode};
use std::path::PathBuf;
use std::process;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EXIT_OK: i32 = 0;
const EXIT_FAILED: i32 = 1;
const EXIT_CORRUPT: i32 = 2;
const EXIT_INTERRUPTED: i32 = 3;

#[derive(Parser, Debug)]
#[command(name = "dpd-ingest")]
#[command(author, version, about = "Resumable DPD scraper and Supabase sync")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Checkpoint file (overrides SCRAPER_CHECKPOINT_PATH)
    #[arg(long, global = true)]
    checkpoint: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scrape (resuming from the checkpoint) and sync new rows
    Run {
        #[command(flatten)]
        scrape: ScrapeArgs,

        #[command(flatten)]
        sync: SyncArgs,

        /// Stop after scraping
        #[arg(long)]
        scrape_only: bool,
    },

    /// Sync the stored checkpoint without scraping
    Sync {
        #[command(flatten)]
        sync: SyncArgs,

        /// Move a corrupt checkpoint aside instead of failing
        #[arg(long)]
        discard_corrupt: bool,
    },

    /// Print a summary of the stored checkpoint
    Inspect,
}

#[derive(Args, Debug)]
struct ScrapeArgs {
    /// Stop once this many records are held
    #[arg(long)]
    limit: Option<usize>,

    /// Log a progress line every N items
    #[arg(long)]
    status_interval: Option<u64>,

    /// Wall-clock budget for the scrape in seconds
    #[arg(long)]
    budget_secs: Option<u64>,

    /// Ignore the stored checkpoint and start a new snapshot
    #[arg(long)]
    fresh: bool,

    /// Move a corrupt checkpoint aside instead of failing
    #[arg(long)]
    discard_corrupt: bool,

    /// Show a progress bar
    #[arg(long)]
    progress: bool,
}

#[derive(Args, Debug)]
struct SyncArgs {
    /// Rows per insert request
    #[arg(long)]
    batch_size: Option<usize>,

    /// Attempts per batch before it is recorded as failed
    #[arg(long)]
    max_retries: Option<u32>,
}

impl ScrapeArgs {
    fn apply(&self, config: &mut IngestConfig) {
        if let Some(limit) = self.limit {
            config.max_rows = limit;
        }
        if let Some(interval) = self.status_interval {
            config.status_interval = interval;
        }
        if let Some(secs) = self.budget_secs {
            config.budget_secs = secs;
        }
        config.show_progress = self.progress;
    }

    fn resume(&self) -> ResumeMode {
        ResumeMode {
            fresh: self.fresh,
            discard_corrupt: self.discard_corrupt,
        }
    }
}

impl SyncArgs {
    fn apply(&self, config: &mut IngestConfig) {
        if let Some(size) = self.batch_size {
            config.batch_size = size;
        }
        if let Some(retries) = self.max_retries {
            config.sync_max_retries = retries;
        }
    }
}

#[tokio::main]
async fn main() {
    let dotenv = dotenvy::dotenv();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("dpd-ingest")
        .build();

    // Environment variables take precedence
    let log_config = log_config.merge_env().unwrap_or_else(|e| {
        eprintln!("Warning: ignoring invalid logging settings: {e}");
        LogConfig::default()
    });
    let guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Warning: logging disabled: {e}");
            None
        },
    };
    if let Some(e) = dotenv_problem(&dotenv) {
        debug!(error = %e, "Ignoring unreadable .env file");
    }

    let code = match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {e:#}");
            exit_code_for(e.downcast_ref::<dpd_ingest::IngestError>().and_then(|e| e.class()))
        },
    };

    drop(guard);
    process::exit(code);
}

async fn execute(cli: Cli) -> Result<i32> {
    let mut config = IngestConfig::from_env()?;
    if let Some(path) = cli.checkpoint {
        config.checkpoint_path = path;
    }

    let (mode, resume) = match &cli.command {
        Command::Inspect => return inspect(&config).await,
        Command::Run {
            scrape,
            sync,
            scrape_only,
        } => {
            scrape.apply(&mut config);
            sync.apply(&mut config);
            let mode = if *scrape_only {
                RunMode::ScrapeOnly
            } else {
                RunMode::Full
            };
            (mode, scrape.resume())
        },
        Command::Sync {
            sync,
            discard_corrupt,
        } => {
            sync.apply(&mut config);
            let resume = ResumeMode {
                fresh: false,
                discard_corrupt: *discard_corrupt,
            };
            (RunMode::SyncOnly, resume)
        },
    };
    config.validate()?;

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let pipeline = Pipeline::from_config(&config)?
        .with_resume(resume)
        .with_cancellation(cancel);

    info!(
        mode = ?mode,
        checkpoint = %config.checkpoint_path.display(),
        source = %config.source_tag,
        table = %config.table,
        "Starting"
    );
    let report = pipeline.run(mode).await?;
    print_summary(&report);
    Ok(report_exit_code(&report))
}

async fn inspect(config: &IngestConfig) -> Result<i32> {
    let store = CheckpointStore::new(config.checkpoint_path.clone());
    match store.load().await {
        Ok(Some(checkpoint)) => {
            println!("{}", serde_json::to_string_pretty(&checkpoint.summary())?);
            Ok(EXIT_OK)
        },
        Ok(None) => {
            println!("No checkpoint at {}", store.path().display());
            Ok(EXIT_OK)
        },
        Err(e) => {
            eprintln!("Error: {e}");
            Ok(exit_code_for(Some(e.class())))
        },
    }
}

/// Cancel `token` on Ctrl-C or SIGTERM so the scrape can checkpoint and stop
fn spawn_signal_listener(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {},
                        _ = term.recv() => {},
                    }
                },
                Err(e) => {
                    warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl-C only");
                    let _ = tokio::signal::ctrl_c().await;
                },
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        warn!("Stop signal received, finishing current item");
        token.cancel();
    });
}

/// A `.env` that exists but failed to load; a missing one is not a problem
fn dotenv_problem<T>(result: &std::result::Result<T, dotenvy::Error>) -> Option<&dotenvy::Error> {
    match result {
        Err(e) if !e.not_found() => Some(e),
        _ => None,
    }
}

fn exit_code_for(class: Option<ErrorClass>) -> i32 {
    match class {
        Some(ErrorClass::Corruption) => EXIT_CORRUPT,
        Some(ErrorClass::Transient) => EXIT_INTERRUPTED,
        _ => EXIT_FAILED,
    }
}

fn report_exit_code(report: &PipelineReport) -> i32 {
    if let Some(class) = report.failure_class() {
        return exit_code_for(Some(class));
    }
    let stopped = report
        .scrape
        .as_ref()
        .is_some_and(|s| s.stop == Some(StopReason::StopRequested));
    if stopped {
        EXIT_INTERRUPTED
    } else {
        EXIT_OK
    }
}

fn print_summary(report: &PipelineReport) {
    if let Some(scrape) = &report.scrape {
        println!(
            "scrape: {} ({} new records, {} skipped, {} held, cursor {})",
            scrape.state,
            scrape.recorded,
            scrape.skipped,
            scrape.checkpoint.records.len(),
            scrape.checkpoint.cursor
        );
        if let Some(failure) = &scrape.failure {
            println!("  {} error: {}", failure.class, failure.message);
        }
    }
    if let (Some(dedup), Some(sync)) = (&report.dedup, &report.sync) {
        println!(
            "sync: {} candidates, {} already present, {} inserted, {} batches",
            dedup.candidates,
            dedup.already_present + sync.already_present,
            sync.inserted,
            sync.batches
        );
        for failure in &sync.failed_batches {
            println!(
                "  batch {} failed ({} rows): {}",
                failure.batch_index,
                failure.row_uids.len(),
                failure.error
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_env_file_is_quiet() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = dotenvy::from_path(dir.path().join(".env"));
        assert!(result.is_err());
        assert!(dotenv_problem(&result).is_none());
    }

    #[test]
    fn test_malformed_env_file_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "DPD_UNCLOSED=\"no closing quote\n").unwrap();

        let result = dotenvy::from_path(&path);
        let problem = dotenv_problem(&result).expect("parse error surfaces");
        assert!(!problem.not_found());
    }

    #[test]
    fn test_exit_codes_by_class() {
        assert_eq!(exit_code_for(Some(ErrorClass::Corruption)), EXIT_CORRUPT);
        assert_eq!(exit_code_for(Some(ErrorClass::Transient)), EXIT_INTERRUPTED);
        assert_eq!(exit_code_for(Some(ErrorClass::PermanentSource)), EXIT_FAILED);
        assert_eq!(exit_code_for(None), EXIT_FAILED);
    }
}
