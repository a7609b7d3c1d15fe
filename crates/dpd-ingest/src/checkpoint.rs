//! Durable journal of scrape progress
//!
//! The checkpoint file is JSON lines: a header naming the schema, source and
//! run, followed by one line per consumed listing item (a record or a skip)
//! and finally a completion marker. Every line carries a SHA-256 digest
//! chained from the line before it, so a damaged or edited line anywhere in
//! the file breaks verification of everything after it.
//!
//! Persisting new items appends their lines and fsyncs, leaving earlier bytes
//! untouched. Only the first write of a snapshot replaces the file, through a
//! sibling temp file that is fsynced and renamed over the target.
//!
//! On load the journal is replayed and checked line by line. Any mismatch is
//! reported as [`CheckpointError::Corrupt`]; nothing is silently dropped
//! except an unterminated final line, which is an append that never
//! completed and was therefore never acknowledged.

use crate::error::CheckpointError;
use crate::types::{EnrichedRecord, ListingCursor, SkippedItem};
use chrono::{DateTime, Utc};
use dpd_common::checksum::{sha256_hex, verify_digest};
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CHECKPOINT_SCHEMA: &str = "dpd-ingest/checkpoint";
pub const CHECKPOINT_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    Record(usize),
    Skipped(usize),
    Completed,
}

/// An entry held in memory that has not reached the journal yet
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingEntry {
    kind: PendingKind,
    consumed: u64,
    cursor: ListingCursor,
    at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub schema: String,
    pub version: u32,
    /// Source tag the records belong to, e.g. "HC"
    pub source: String,
    pub run_id: Uuid,
    /// Journal entries persisted so far
    pub sequence: u64,
    pub started_at: DateTime<Utc>,
    /// Time of the last persisted entry
    pub updated_at: DateTime<Utc>,
    /// Next listing position to pull
    pub cursor: ListingCursor,
    /// Listing items consumed so far; always `records + skipped`
    pub consumed: u64,
    pub completed: bool,
    pub records: Vec<EnrichedRecord>,
    pub skipped: Vec<SkippedItem>,
    /// Chained digest of the last persisted line
    pub digest: String,
    /// Bytes of verified journal on disk; 0 until the header is written
    journal_len: u64,
    pending: Vec<PendingEntry>,
}

impl Checkpoint {
    /// Fresh snapshot positioned at the start of the listing
    pub fn empty(source: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            schema: CHECKPOINT_SCHEMA.to_string(),
            version: CHECKPOINT_VERSION,
            source: source.into(),
            run_id: Uuid::new_v4(),
            sequence: 0,
            started_at: now,
            updated_at: now,
            cursor: ListingCursor::START,
            consumed: 0,
            completed: false,
            records: Vec::new(),
            skipped: Vec::new(),
            digest: String::new(),
            journal_len: 0,
            pending: Vec::new(),
        }
    }

    fn queue(&mut self, kind: PendingKind) {
        self.pending.push(PendingEntry {
            kind,
            consumed: self.consumed,
            cursor: self.cursor,
            at: Utc::now(),
        });
    }

    pub fn push_record(&mut self, record: EnrichedRecord, cursor: ListingCursor) {
        self.records.push(record);
        self.consumed += 1;
        self.cursor = cursor;
        self.queue(PendingKind::Record(self.records.len() - 1));
    }

    pub fn push_skipped(&mut self, skipped: SkippedItem, cursor: ListingCursor) {
        self.skipped.push(skipped);
        self.consumed += 1;
        self.cursor = cursor;
        self.queue(PendingKind::Skipped(self.skipped.len() - 1));
    }

    /// Mark the snapshot finished; no items may follow
    pub fn complete(&mut self) {
        if !self.completed {
            self.completed = true;
            self.queue(PendingKind::Completed);
        }
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumed == 0
    }

    /// Entries changed in memory since the last successful save
    pub fn unsaved(&self) -> usize {
        self.pending.len()
    }

    fn entry_ref(&self, kind: PendingKind) -> EntryRef<'_> {
        match kind {
            PendingKind::Record(i) => EntryRef::Record(&self.records[i]),
            PendingKind::Skipped(i) => EntryRef::Skipped(&self.skipped[i]),
            PendingKind::Completed => EntryRef::Completed,
        }
    }

    /// Encode the header (for a new file) and every pending entry.
    ///
    /// Nothing on `self` changes; [`Checkpoint::commit`] applies the result
    /// once the bytes are on disk.
    fn encode_pending(&self, with_header: bool) -> Result<Encoded, serde_json::Error> {
        let mut bytes = Vec::new();
        let mut digest = self.digest.clone();

        if with_header {
            let header = HeaderBody {
                schema: &self.schema,
                version: self.version,
                source: &self.source,
                run_id: self.run_id,
                started_at: self.started_at,
            };
            digest = seal_line(&mut bytes, "", &header)?;
        }

        let mut sequence = self.sequence;
        let mut updated_at = self.updated_at;
        for entry in &self.pending {
            sequence += 1;
            let body = EntryBody {
                seq: sequence,
                consumed: entry.consumed,
                cursor: entry.cursor,
                at: entry.at,
                entry: self.entry_ref(entry.kind),
            };
            digest = seal_line(&mut bytes, &digest, &body)?;
            updated_at = entry.at;
        }

        Ok(Encoded {
            bytes,
            digest,
            sequence,
            updated_at,
        })
    }

    fn commit(&mut self, encoded: Encoded, journal_len: u64) {
        self.digest = encoded.digest;
        self.sequence = encoded.sequence;
        self.updated_at = encoded.updated_at;
        self.journal_len = journal_len;
        self.pending.clear();
    }

    /// Rebuild a checkpoint from journal bytes, verifying every line
    fn replay(bytes: &[u8]) -> Result<Self, String> {
        let complete = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
        if complete < bytes.len() {
            warn!(
                bytes = bytes.len() - complete,
                "Ignoring unfinished line at the end of the checkpoint journal"
            );
        }

        let mut lines = bytes[..complete]
            .split_inclusive(|b| *b == b'\n')
            .map(|line| &line[..line.len() - 1]);

        let header_line = lines.next().ok_or_else(|| "no header line".to_string())?;
        let header: HeaderLine =
            serde_json::from_slice(header_line).map_err(|e| format!("unreadable header: {e}"))?;
        if header.schema != CHECKPOINT_SCHEMA {
            return Err(format!("unexpected schema tag '{}'", header.schema));
        }
        if header.version != CHECKPOINT_VERSION {
            return Err(format!("unsupported version {}", header.version));
        }
        let header_body = HeaderBody {
            schema: &header.schema,
            version: header.version,
            source: &header.source,
            run_id: header.run_id,
            started_at: header.started_at,
        };
        check_line("", &header_body, &header.digest, "header")?;

        let mut checkpoint = Checkpoint::empty(header.source.clone());
        checkpoint.run_id = header.run_id;
        checkpoint.started_at = header.started_at;
        checkpoint.updated_at = header.started_at;
        checkpoint.digest = header.digest;

        for (n, raw) in lines.enumerate() {
            let n = n as u64 + 1;
            let line: EntryLine =
                serde_json::from_slice(raw).map_err(|e| format!("unreadable entry {n}: {e}"))?;
            checkpoint.apply(n, line)?;
        }

        checkpoint.journal_len = complete as u64;
        Ok(checkpoint)
    }

    fn apply(&mut self, n: u64, line: EntryLine) -> Result<(), String> {
        if self.completed {
            return Err(format!("entry {n} follows the completion marker"));
        }
        if line.seq != n {
            return Err(format!("entry {n} carries sequence {}", line.seq));
        }

        let held = self.consumed + u64::from(!matches!(line.entry, Entry::Completed));
        if line.consumed > held {
            return Err(format!(
                "resume position {} is past the {held} items it holds",
                line.consumed
            ));
        }
        if line.consumed < held {
            return Err(format!(
                "resume position {} is behind the {held} items it holds",
                line.consumed
            ));
        }

        match &line.entry {
            Entry::Completed if line.cursor != self.cursor => {
                return Err(format!("completion marker moves the resume position to {}", line.cursor));
            },
            Entry::Completed => {},
            _ if line.cursor <= self.cursor => {
                return Err(format!(
                    "entry {n} moves the resume position from {} back to {}",
                    self.cursor, line.cursor
                ));
            },
            Entry::Record(record) if record.page != line.cursor.page => {
                return Err(format!(
                    "entry {n} holds an item from page {} but resumes at {}",
                    record.page, line.cursor
                ));
            },
            _ => {},
        }

        let body = EntryBody {
            seq: line.seq,
            consumed: line.consumed,
            cursor: line.cursor,
            at: line.at,
            entry: match &line.entry {
                Entry::Record(record) => EntryRef::Record(record),
                Entry::Skipped(skipped) => EntryRef::Skipped(skipped),
                Entry::Completed => EntryRef::Completed,
            },
        };
        check_line(&self.digest, &body, &line.digest, &format!("entry {n}"))?;

        match line.entry {
            Entry::Record(record) => self.records.push(record),
            Entry::Skipped(skipped) => self.skipped.push(skipped),
            Entry::Completed => self.completed = true,
        }
        self.sequence = line.seq;
        self.consumed = line.consumed;
        self.cursor = line.cursor;
        self.updated_at = line.at;
        self.digest = line.digest;
        Ok(())
    }

    pub fn summary(&self) -> CheckpointSummary {
        CheckpointSummary {
            source: self.source.clone(),
            run_id: self.run_id,
            sequence: self.sequence,
            records: self.records.len(),
            skipped: self.skipped.len(),
            cursor: self.cursor,
            completed: self.completed,
            started_at: self.started_at,
            updated_at: self.updated_at,
        }
    }
}

struct Encoded {
    bytes: Vec<u8>,
    digest: String,
    sequence: u64,
    updated_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct HeaderBody<'a> {
    schema: &'a str,
    version: u32,
    source: &'a str,
    run_id: Uuid,
    started_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct HeaderLine {
    schema: String,
    version: u32,
    source: String,
    run_id: Uuid,
    started_at: DateTime<Utc>,
    digest: String,
}

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
enum EntryRef<'a> {
    Record(&'a EnrichedRecord),
    Skipped(&'a SkippedItem),
    Completed,
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum Entry {
    Record(EnrichedRecord),
    Skipped(SkippedItem),
    Completed,
}

#[derive(Serialize)]
struct EntryBody<'a> {
    seq: u64,
    consumed: u64,
    cursor: ListingCursor,
    at: DateTime<Utc>,
    entry: EntryRef<'a>,
}

#[derive(Deserialize)]
struct EntryLine {
    seq: u64,
    consumed: u64,
    cursor: ListingCursor,
    at: DateTime<Utc>,
    entry: Entry,
    digest: String,
}

#[derive(Serialize)]
struct Sealed<'a, T: Serialize> {
    #[serde(flatten)]
    body: &'a T,
    digest: &'a str,
}

/// Bytes a line's digest is taken over: the previous digest, then the body
fn chained(previous: &str, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(previous.len() + body.len());
    buf.extend_from_slice(previous.as_bytes());
    buf.extend_from_slice(body);
    buf
}

/// Append `body` plus its chained digest to `out` as one line
fn seal_line<T: Serialize>(out: &mut Vec<u8>, previous: &str, body: &T) -> Result<String, serde_json::Error> {
    let digest = sha256_hex(&chained(previous, &serde_json::to_vec(body)?));
    serde_json::to_writer(&mut *out, &Sealed { body, digest: &digest })?;
    out.push(b'\n');
    Ok(digest)
}

fn check_line<T: Serialize>(previous: &str, body: &T, stored: &str, what: &str) -> Result<(), String> {
    let encoded = serde_json::to_vec(body).map_err(|e| format!("cannot re-encode {what}: {e}"))?;
    verify_digest(&chained(previous, &encoded), stored).map_err(|e| format!("digest mismatch at {what}: {e}"))
}

/// Compact view of a checkpoint for status output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointSummary {
    pub source: String,
    pub run_id: Uuid,
    pub sequence: u64,
    pub records: usize,
    pub skipped: usize,
    pub cursor: ListingCursor,
    pub completed: bool,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Single-writer store for one checkpoint file
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "checkpoint.jsonl".into());
        name.push(suffix);
        self.path.with_file_name(name)
    }

    fn io_error(&self, source: std::io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn corrupt(&self, reason: impl Into<String>) -> CheckpointError {
        CheckpointError::Corrupt {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }

    /// Read and verify the checkpoint. `None` means no run has written one.
    pub async fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No checkpoint on disk");
                return Ok(None);
            },
            Err(e) => return Err(self.io_error(e)),
        };

        let checkpoint = Checkpoint::replay(&bytes).map_err(|reason| self.corrupt(reason))?;

        debug!(
            path = %self.path.display(),
            sequence = checkpoint.sequence,
            records = checkpoint.records.len(),
            cursor = %checkpoint.cursor,
            "Loaded checkpoint"
        );
        Ok(Some(checkpoint))
    }

    pub async fn load_or_empty(&self, source: &str) -> Result<Checkpoint, CheckpointError> {
        Ok(self
            .load()
            .await?
            .unwrap_or_else(|| Checkpoint::empty(source)))
    }

    /// Durably write every entry of `checkpoint` not yet on disk.
    ///
    /// The first save of a snapshot replaces the file; later saves append.
    /// `checkpoint` is left untouched when the write fails.
    pub async fn save(&self, checkpoint: &mut Checkpoint) -> Result<(), CheckpointError> {
        let fresh = checkpoint.journal_len == 0;
        if !fresh && checkpoint.pending.is_empty() {
            return Ok(());
        }

        let encoded = checkpoint.encode_pending(fresh)?;
        let journal_len = if fresh {
            self.replace(&encoded.bytes).await?;
            encoded.bytes.len() as u64
        } else {
            self.append_at(checkpoint.journal_len, &encoded.bytes).await?;
            checkpoint.journal_len + encoded.bytes.len() as u64
        };

        debug!(
            sequence = encoded.sequence,
            records = checkpoint.records.len(),
            bytes = encoded.bytes.len(),
            "Checkpoint persisted"
        );
        checkpoint.commit(encoded, journal_len);
        Ok(())
    }

    async fn replace(&self, bytes: &[u8]) -> Result<(), CheckpointError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }

        let temp = self.sibling(".tmp");
        let mut file = tokio::fs::File::create(&temp)
            .await
            .map_err(|e| self.io_error(e))?;
        file.write_all(bytes).await.map_err(|e| self.io_error(e))?;
        file.sync_all().await.map_err(|e| self.io_error(e))?;
        drop(file);

        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        self.sync_parent_dir().await;
        Ok(())
    }

    /// Write `bytes` at `offset`, dropping whatever an interrupted earlier
    /// append left past it
    async fn append_at(&self, offset: u64, bytes: &[u8]) -> Result<(), CheckpointError> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        file.set_len(offset).await.map_err(|e| self.io_error(e))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| self.io_error(e))?;
        file.write_all(bytes).await.map_err(|e| self.io_error(e))?;
        file.sync_data().await.map_err(|e| self.io_error(e))?;
        Ok(())
    }

    #[cfg(unix)]
    async fn sync_parent_dir(&self) {
        let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) else {
            return;
        };
        match tokio::fs::File::open(parent).await {
            Ok(dir) => {
                if let Err(e) = dir.sync_all().await {
                    warn!(error = %e, "Failed to fsync checkpoint directory");
                }
            },
            Err(e) => warn!(error = %e, "Failed to open checkpoint directory for fsync"),
        }
    }

    #[cfg(not(unix))]
    async fn sync_parent_dir(&self) {}

    /// Record one enriched item and persist before returning
    pub async fn append(
        &self,
        mut checkpoint: Checkpoint,
        record: EnrichedRecord,
        cursor: ListingCursor,
    ) -> Result<Checkpoint, CheckpointError> {
        checkpoint.push_record(record, cursor);
        self.save(&mut checkpoint).await?;
        Ok(checkpoint)
    }

    /// Record one consumed-but-unrecorded item and persist before returning
    pub async fn skip(
        &self,
        mut checkpoint: Checkpoint,
        skipped: SkippedItem,
        cursor: ListingCursor,
    ) -> Result<Checkpoint, CheckpointError> {
        checkpoint.push_skipped(skipped, cursor);
        self.save(&mut checkpoint).await?;
        Ok(checkpoint)
    }

    pub async fn mark_completed(
        &self,
        mut checkpoint: Checkpoint,
    ) -> Result<Checkpoint, CheckpointError> {
        checkpoint.complete();
        self.save(&mut checkpoint).await?;
        Ok(checkpoint)
    }

    /// Move an unusable checkpoint aside so a new run can start.
    ///
    /// Returns where the old file went, or `None` if there was nothing to move.
    pub async fn discard(&self) -> Result<Option<PathBuf>, CheckpointError> {
        match tokio::fs::metadata(&self.path).await {
            Ok(_) => {},
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        }

        let target = self.sibling(&format!(".corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S")));
        tokio::fs::rename(&self.path, &target)
            .await
            .map_err(|e| self.io_error(e))?;
        info!(from = %self.path.display(), to = %target.display(), "Checkpoint moved aside");
        Ok(Some(target))
    }
}
