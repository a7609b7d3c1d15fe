//! DPD Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities and error handling for the DPD sync workspace.
//!
//! # Overview
//!
//! - **Error Handling**: Digest mismatch error and result alias
//! - **Checksums**: SHA-256 digests used to detect damaged snapshot files
//! - **Logging**: Centralized `tracing` subscriber setup
//! - **Text**: Whitespace normalization for scraped HTML text
//!
//! # Example
//!
//! ```no_run
//! use dpd_common::checksum::{sha256_hex, verify_digest};
//!
//! fn check(bytes: &[u8], expected: &str) -> dpd_common::Result<()> {
//!     verify_digest(bytes, expected)?;
//!     println!("digest ok: {}", sha256_hex(bytes));
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod text;

// Re-export commonly used types
pub use error::{DpdError, Result};
