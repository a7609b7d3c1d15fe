//! PostgREST (Supabase) implementation of [`RemoteStore`]

use super::RemoteStore;
use crate::error::RemoteError;
use crate::mapper::MappedRow;
use async_trait::async_trait;
use reqwest::{header, Client, Response, StatusCode};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

/// Rows requested per page when reading existing `row_uid`s
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Postgres error code for unique constraint violations
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Clone)]
pub struct PostgrestConfig {
    /// Project URL, e.g. `https://xyz.supabase.co`
    pub url: String,
    pub service_key: String,
    pub table: String,
    pub timeout: Duration,
    pub page_size: usize,
}

impl PostgrestConfig {
    pub fn new(url: impl Into<String>, service_key: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            service_key: service_key.into(),
            table: table.into(),
            timeout: Duration::from_secs(60),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Rows written by other tools may lack a `row_uid`
#[derive(Deserialize)]
struct RowUidOnly {
    row_uid: Option<String>,
}

pub struct PostgrestStore {
    client: Client,
    table_url: String,
    page_size: usize,
}

impl PostgrestStore {
    pub fn new(config: PostgrestConfig) -> crate::Result<Self> {
        let mut headers = header::HeaderMap::new();
        let key = header::HeaderValue::from_str(&config.service_key)
            .map_err(|_| crate::IngestError::Config("service key is not a valid header value".into()))?;
        let bearer = header::HeaderValue::from_str(&format!("Bearer {}", config.service_key))
            .map_err(|_| crate::IngestError::Config("service key is not a valid header value".into()))?;
        headers.insert("apikey", key);
        headers.insert(header::AUTHORIZATION, bearer);

        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            table_url: format!("{}/rest/v1/{}", config.url.trim_end_matches('/'), config.table),
            page_size: config.page_size.max(1),
        })
    }

    async fn failure(response: Response) -> RemoteError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let detail = format!("HTTP {status}: {}", body.trim());

        if status == StatusCode::CONFLICT || body.contains(UNIQUE_VIOLATION) {
            RemoteError::Conflict(detail)
        } else if status.is_server_error()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
        {
            RemoteError::Transient(detail)
        } else {
            RemoteError::Rejected(detail)
        }
    }
}

fn transport(err: reqwest::Error) -> RemoteError {
    RemoteError::Transient(format!("request failed: {err}"))
}

#[async_trait]
impl RemoteStore for PostgrestStore {
    async fn fetch_row_uids(&self, source: &str) -> Result<HashSet<String>, RemoteError> {
        let mut uids = HashSet::new();
        let mut offset = 0usize;
        let source_filter = format!("eq.{source}");

        loop {
            let response = self
                .client
                .get(&self.table_url)
                .query(&[
                    ("select", "row_uid"),
                    ("source", source_filter.as_str()),
                    ("order", "row_uid.asc"),
                ])
                .query(&[("offset", offset), ("limit", self.page_size)])
                .send()
                .await
                .map_err(transport)?;
            if !response.status().is_success() {
                return Err(Self::failure(response).await);
            }

            let body = response
                .bytes()
                .await
                .map_err(|e| RemoteError::Transient(format!("row_uid page cut short: {e}")))?;
            let page: Vec<RowUidOnly> = serde_json::from_slice(&body)
                .map_err(|e| RemoteError::Rejected(format!("unreadable row_uid page: {e}")))?;
            let fetched = page.len();
            let without_uid = page.iter().filter(|r| r.row_uid.is_none()).count();
            uids.extend(page.into_iter().filter_map(|r| r.row_uid));
            debug!(
                offset,
                fetched,
                without_uid,
                total = uids.len(),
                "Fetched row_uid page"
            );

            if fetched < self.page_size {
                break;
            }
            offset += fetched;
        }

        Ok(uids)
    }

    async fn insert_rows(&self, rows: &[MappedRow]) -> Result<(), RemoteError> {
        if rows.is_empty() {
            return Ok(());
        }
        let response = self
            .client
            .post(&self.table_url)
            .header("Prefer", "return=minimal")
            .json(rows)
            .send()
            .await
            .map_err(transport)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::failure(response).await)
        }
    }
}
