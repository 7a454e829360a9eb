//! Discovery state for objects and folders seen by the ingestion producers.
//!
//! Two producers report objects independently: bucket notifications in real
//! time and a periodic full bucket scan. Both call
//! [`DiscoveryStateStore::get_or_create`], which inserts an `UNKNOWN` row if
//! none exists and then reads the row back, so concurrent first sightings
//! converge on a single record.
//!
//! State changes are unconditional overwrites. A failure keeps a message cut
//! to [`ERROR_MESSAGE_MAX_CHARS`] characters plus the full detail as bytes.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cursor::{PageSource, PagedCursor};
use crate::error::{Error, Result, require_non_empty};

/// Longest error message persisted on a discovery record, in characters.
pub const ERROR_MESSAGE_MAX_CHARS: usize = 2999;

/// Page size of [`DiscoveryStateStore::list_by_state`].
pub const FOLDER_PAGE_SIZE: usize = 1000;

/// Processing state of a discovered object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileState {
    /// Seen but not yet processed.
    Unknown,
    /// A consumer is working on it.
    Processing,
    /// Processed successfully.
    Complete,
    /// Processing failed; see the record's error.
    Failed,
}

impl FileState {
    /// Stored representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Processing => "PROCESSING",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "UNKNOWN" => Ok(Self::Unknown),
            "PROCESSING" => Ok(Self::Processing),
            "COMPLETE" => Ok(Self::Complete),
            "FAILED" => Ok(Self::Failed),
            other => Err(Error::InvalidInput(format!("unknown file state '{other}'"))),
        }
    }
}

/// Lifecycle state of a discovered folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FolderState {
    /// Still receiving new objects.
    Rolling,
    /// Closed and collated.
    Collated,
}

impl FolderState {
    /// Stored representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rolling => "ROLLING",
            Self::Collated => "COLLATED",
        }
    }
}

impl fmt::Display for FolderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FolderState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ROLLING" => Ok(Self::Rolling),
            "COLLATED" => Ok(Self::Collated),
            other => Err(Error::InvalidInput(format!("unknown folder state '{other}'"))),
        }
    }
}

/// Tracking row for one object, keyed by `(bucket, key)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryRecord {
    /// Bucket holding the object.
    pub bucket: String,
    /// Object key.
    pub key: String,
    /// Current state.
    pub state: FileState,
    /// Last state change.
    pub updated_on: DateTime<Utc>,
    /// Truncated failure message.
    pub error: Option<String>,
    /// Full failure detail.
    pub error_details: Option<Vec<u8>>,
}

/// Tracking row for one folder, keyed by `(bucket, path)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderRecord {
    /// Bucket holding the folder.
    pub bucket: String,
    /// Folder path (key prefix).
    pub path: String,
    /// Current state.
    pub state: FolderState,
    /// Last sighting.
    pub updated_on: DateTime<Utc>,
}

/// Why an object moved to a new state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReason {
    /// Human-readable message, truncated when persisted.
    pub message: String,
    /// Full diagnostic detail.
    pub details: Vec<u8>,
}

impl FailureReason {
    /// Builds a reason from a message and detail text.
    #[must_use]
    pub fn new(message: impl Into<String>, details: impl Into<Vec<u8>>) -> Self {
        Self {
            message: message.into(),
            details: details.into(),
        }
    }

    /// Builds a reason from an error; the detail carries the full source chain.
    #[must_use]
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut details = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            details.push_str("\ncaused by: ");
            details.push_str(&cause.to_string());
            source = cause.source();
        }
        Self {
            message: err.to_string(),
            details: details.into_bytes(),
        }
    }
}

/// Cuts `message` to at most `max_chars` characters on a char boundary.
#[must_use]
pub fn truncate_chars(message: &str, max_chars: usize) -> &str {
    match message.char_indices().nth(max_chars) {
        Some((idx, _)) => &message[..idx],
        None => message,
    }
}

/// Full replacement of a record's mutable columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStateUpdate {
    /// Bucket of the record.
    pub bucket: String,
    /// Key of the record.
    pub key: String,
    /// New state.
    pub state: FileState,
    /// Change time.
    pub updated_on: DateTime<Utc>,
    /// Truncated message, or `None` to clear.
    pub error: Option<String>,
    /// Detail bytes, or `None` to clear.
    pub error_details: Option<Vec<u8>>,
}

/// Persistence for discovery and folder records.
#[async_trait]
pub trait DiscoveryBackend: Send + Sync + 'static {
    /// Inserts a row with `state` unless `(bucket, key)` already exists.
    async fn insert_file_if_absent(
        &self,
        bucket: &str,
        key: &str,
        state: FileState,
        updated_on: DateTime<Utc>,
    ) -> Result<()>;

    /// Reads a row.
    async fn get_file(&self, bucket: &str, key: &str) -> Result<Option<DiscoveryRecord>>;

    /// Overwrites the mutable columns of an existing row; no-op if absent.
    async fn update_file_state(&self, update: &FileStateUpdate) -> Result<()>;

    /// Returns true if the row exists.
    async fn file_exists(&self, bucket: &str, key: &str) -> Result<bool>;

    /// Inserts or overwrites a folder row with the given state and time.
    async fn upsert_folder(&self, folder: &FolderRecord) -> Result<()>;

    /// Returns up to `limit` folders in `state`, ordered by path, after `after_path`.
    async fn list_folders_page(
        &self,
        bucket: &str,
        state: FolderState,
        after_path: Option<&str>,
        limit: usize,
    ) -> Result<Vec<FolderRecord>>;
}

/// Tracks what has been discovered and how far it got.
pub struct DiscoveryStateStore<B: DiscoveryBackend + ?Sized> {
    backend: Arc<B>,
}

impl<B: DiscoveryBackend + ?Sized> Clone for DiscoveryStateStore<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: DiscoveryBackend + ?Sized> DiscoveryStateStore<B> {
    /// Creates a store over `backend`.
    #[must_use]
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    /// Inserts an `UNKNOWN` record if absent, then returns the current record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for empty identifiers and propagates
    /// store failures.
    pub async fn get_or_create(&self, bucket: &str, key: &str) -> Result<DiscoveryRecord> {
        require_non_empty("bucket", bucket)?;
        require_non_empty("key", key)?;

        self.backend
            .insert_file_if_absent(bucket, key, FileState::Unknown, Utc::now())
            .await?;
        self.backend
            .get_file(bucket, key)
            .await?
            .ok_or_else(|| Error::database(format!("discovery record {bucket}/{key} vanished")))
    }

    /// Overwrites the record's state.
    ///
    /// With a reason, stores the truncated message and the full detail;
    /// without one, clears both. Untracked keys are left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for empty identifiers and propagates
    /// store failures.
    pub async fn transition(
        &self,
        bucket: &str,
        key: &str,
        state: FileState,
        reason: Option<&FailureReason>,
    ) -> Result<()> {
        require_non_empty("bucket", bucket)?;
        require_non_empty("key", key)?;

        let update = FileStateUpdate {
            bucket: bucket.to_string(),
            key: key.to_string(),
            state,
            updated_on: Utc::now(),
            error: reason.map(|r| truncate_chars(&r.message, ERROR_MESSAGE_MAX_CHARS).to_string()),
            error_details: reason.map(|r| r.details.clone()),
        };
        tracing::debug!(bucket, key, %state, "discovery state transition");
        self.backend.update_file_state(&update).await
    }

    /// Moves the record to `FAILED` with `reason`.
    ///
    /// # Errors
    ///
    /// See [`transition`](Self::transition).
    pub async fn mark_failed(&self, bucket: &str, key: &str, reason: &FailureReason) -> Result<()> {
        self.transition(bucket, key, FileState::Failed, Some(reason))
            .await
    }

    /// Returns true if the object is already tracked.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for empty identifiers and propagates
    /// store failures.
    pub async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        require_non_empty("bucket", bucket)?;
        require_non_empty("key", key)?;
        self.backend.file_exists(bucket, key).await
    }

    /// Inserts or updates a folder; the given state is written in both cases.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for empty identifiers and propagates
    /// store failures.
    pub async fn upsert_folder(&self, folder: &FolderRecord) -> Result<()> {
        require_non_empty("bucket", &folder.bucket)?;
        require_non_empty("path", &folder.path)?;
        self.backend.upsert_folder(folder).await
    }

    /// Lazily lists folders of `bucket` in `state`, ordered by path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty bucket.
    pub fn list_by_state(
        &self,
        bucket: &str,
        state: FolderState,
    ) -> Result<PagedCursor<FolderPages<B>>> {
        require_non_empty("bucket", bucket)?;
        PagedCursor::new(
            FolderPages {
                backend: Arc::clone(&self.backend),
                bucket: bucket.to_string(),
                state,
            },
            FOLDER_PAGE_SIZE,
        )
    }
}

/// Page source over folders of one bucket and state.
pub struct FolderPages<B: DiscoveryBackend + ?Sized> {
    backend: Arc<B>,
    bucket: String,
    state: FolderState,
}

#[async_trait]
impl<B: DiscoveryBackend + ?Sized> PageSource for FolderPages<B> {
    type Item = FolderRecord;

    async fn fetch_page(
        &self,
        after: Option<&FolderRecord>,
        limit: usize,
    ) -> Result<Vec<FolderRecord>> {
        self.backend
            .list_folders_page(
                &self.bucket,
                self.state,
                after.map(|f| f.path.as_str()),
                limit,
            )
            .await
    }
}
