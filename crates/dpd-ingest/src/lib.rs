//! DPD Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Resumable scrape of the Health Canada Drug Product Database and
//! incremental insert-only sync of the harvested records into a PostgREST
//! table.
//!
//! # Pipeline
//!
//! ```text
//! ListingFetcher -> DetailEnricher -> CheckpointStore
//!                                          |
//!                       Mapper -> Dedup -> SyncWriter -> RemoteStore
//! ```
//!
//! The scrape loop persists every enriched record to an atomically replaced
//! checkpoint file, so a run killed at any point resumes where it stopped.
//! The sync stage only inserts rows whose `row_uid` is not already present
//! remotely, which makes re-running it harmless.
//!
//! # Example
//!
//! ```no_run
//! use dpd_ingest::config::IngestConfig;
//! use dpd_ingest::pipeline::{Pipeline, RunMode};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     let pipeline = Pipeline::from_config(&config)?;
//!     let report = pipeline.run(RunMode::Full).await?;
//!     println!("inserted {}", report.sync.map(|s| s.inserted).unwrap_or(0));
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod dedup;
pub mod detail;
pub mod error;
pub mod listing;
pub mod mapper;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod remote;
pub mod retry;
pub mod source;
pub mod sync;
pub mod types;

pub use error::{IngestError, Result};
