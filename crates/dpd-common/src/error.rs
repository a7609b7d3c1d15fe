//! Error types shared across DPD crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, DpdError>;

/// Base error type for DPD crates
#[derive(Error, Debug)]
pub enum DpdError {
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}
