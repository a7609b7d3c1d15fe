//! Remote store collaborator: the table rows are synced into

pub mod postgrest;

use crate::error::RemoteError;
use crate::mapper::MappedRow;
use crate::retry::Attempt;
use async_trait::async_trait;
use std::collections::HashSet;

pub use postgrest::{PostgrestConfig, PostgrestStore};

/// Insert-only view of the remote table
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Every `row_uid` currently stored for `source`
    async fn fetch_row_uids(&self, source: &str) -> Result<HashSet<String>, RemoteError>;

    /// Insert `rows` as one request. A uniqueness violation on any row must
    /// be reported as [`RemoteError::Conflict`].
    async fn insert_rows(&self, rows: &[MappedRow]) -> Result<(), RemoteError>;
}

impl RemoteError {
    /// Only transient failures are worth another attempt
    pub fn into_attempt<T>(self) -> Attempt<T> {
        match self {
            RemoteError::Transient(reason) => Attempt::Retryable(reason),
            other => Attempt::Fatal(other.to_string()),
        }
    }
}
