//! Error taxonomy for the scrape and sync stages

use crate::retry::RetryError;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestError>;

/// Coarse classification used in logs and exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    PermanentItem,
    PermanentSource,
    Corruption,
    RemoteConflict,
    BatchFailure,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::PermanentItem => "permanent_item",
            ErrorClass::PermanentSource => "permanent_source",
            ErrorClass::Corruption => "corruption",
            ErrorClass::RemoteConflict => "remote_conflict",
            ErrorClass::BatchFailure => "batch_failure",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Listing page could not be obtained
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("listing page {page} still failing after {attempts} attempts: {reason}")]
    Transient {
        page: u64,
        attempts: u32,
        reason: String,
    },

    #[error("listing page {page} cannot be used: {reason}")]
    Source { page: u64, reason: String },
}

impl FetchError {
    pub fn from_retry(page: u64, err: RetryError) -> Self {
        match err {
            RetryError::Exhausted { attempts, last } => FetchError::Transient {
                page,
                attempts,
                reason: last,
            },
            RetryError::Fatal(reason) | RetryError::Refused(reason) => {
                FetchError::Source { page, reason }
            },
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            FetchError::Transient { .. } => ErrorClass::Transient,
            FetchError::Source { .. } => ErrorClass::PermanentSource,
        }
    }
}

/// Detail page could not be turned into a record
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnrichError {
    #[error("detail for {natural_key} is unavailable: {reason}")]
    Permanent { natural_key: String, reason: String },

    /// The source refused the detail request itself (401/403); every
    /// remaining item would meet the same answer
    #[error("source refused detail for {natural_key}: {reason}")]
    SourceRejected { natural_key: String, reason: String },

    #[error("detail for {natural_key} still failing after {attempts} attempts: {reason}")]
    Transient {
        natural_key: String,
        attempts: u32,
        reason: String,
    },
}

impl EnrichError {
    pub fn from_retry(natural_key: &str, err: RetryError) -> Self {
        match err {
            RetryError::Exhausted { attempts, last } => EnrichError::Transient {
                natural_key: natural_key.to_string(),
                attempts,
                reason: last,
            },
            RetryError::Fatal(reason) => EnrichError::Permanent {
                natural_key: natural_key.to_string(),
                reason,
            },
            RetryError::Refused(reason) => EnrichError::SourceRejected {
                natural_key: natural_key.to_string(),
                reason,
            },
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            EnrichError::Permanent { .. } => ErrorClass::PermanentItem,
            EnrichError::SourceRejected { .. } => ErrorClass::PermanentSource,
            EnrichError::Transient { .. } => ErrorClass::Transient,
        }
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint {} is corrupt: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("checkpoint I/O failed on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode checkpoint: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CheckpointError {
    pub fn is_corrupt(&self) -> bool {
        matches!(self, CheckpointError::Corrupt { .. })
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            CheckpointError::Corrupt { .. } => ErrorClass::Corruption,
            CheckpointError::Io { .. } | CheckpointError::Encode(_) => ErrorClass::Transient,
        }
    }
}

/// Failure reported by a [`crate::remote::RemoteStore`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote store temporarily unavailable: {0}")]
    Transient(String),

    #[error("uniqueness conflict: {0}")]
    Conflict(String),

    #[error("remote store rejected the request: {0}")]
    Rejected(String),
}

impl RemoteError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RemoteError::Transient(_) => ErrorClass::Transient,
            RemoteError::Conflict(_) => ErrorClass::RemoteConflict,
            RemoteError::Rejected(_) => ErrorClass::BatchFailure,
        }
    }
}

/// Top-level error for pipeline entry points
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("failed to read existing row_uids: {0}")]
    RemoteSnapshot(#[source] RemoteError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("HTTP client setup failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl IngestError {
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            IngestError::Checkpoint(e) => Some(e.class()),
            IngestError::RemoteSnapshot(e) => Some(e.class()),
            IngestError::Config(_) | IngestError::Http(_) => None,
        }
    }
}
