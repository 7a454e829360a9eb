//! Object storage abstraction for snapshot artifacts and coordination files.
//!
//! Objects are addressed by `(bucket, key)`. The contract covers what the
//! ingestion side needs:
//! - Whole-object reads of snapshot artifacts
//! - Prefix listing for the periodic bucket scan
//! - Conditional writes with preconditions for the counting semaphore
//!
//! Version tokens are opaque strings so S3 `ETag`s and numeric generations
//! both fit.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Precondition for conditional writes (CAS operations).
#[derive(Debug, Clone)]
pub enum WritePrecondition {
    /// Write only if object does not exist.
    DoesNotExist,
    /// Write only if object's version matches the given token.
    MatchesVersion(String),
    /// Write unconditionally.
    None,
}

/// Result of a conditional write.
#[derive(Debug, Clone)]
pub enum WriteResult {
    /// Write succeeded, returns new version token.
    Success {
        /// The new version token after the write.
        version: String,
    },
    /// Precondition failed, returns current version token.
    PreconditionFailed {
        /// The current version that caused the precondition to fail.
        current_version: String,
    },
}

impl WriteResult {
    /// Returns true if the write was applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Summary of a stored object, as produced by listings and event notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSummary {
    /// Bucket holding the object.
    pub bucket: String,
    /// Object key.
    pub key: String,
    /// Entity tag, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// Object size in bytes.
    pub size: u64,
    /// Last modification timestamp, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

/// Metadata about a stored object, including its CAS version.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Listing summary.
    pub summary: ObjectSummary,
    /// Opaque version token for conditional writes.
    pub version: String,
}

/// Object storage keyed by bucket and key.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Reads an entire object.
    ///
    /// Returns `Error::NotFound` if the object doesn't exist.
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes>;

    /// Writes with a precondition.
    ///
    /// A failed precondition is a normal [`WriteResult`], not an error.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Deletes an object. Succeeds if the object doesn't exist.
    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    /// Lists objects under `prefix`, ordered by key.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectSummary>>;

    /// Reads object metadata without content. `None` if absent.
    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>>;
}

/// In-memory object store for tests and local runs.
///
/// Versions are numeric generations exposed as strings.
#[derive(Debug, Default, Clone)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<BTreeMap<(String, String), StoredObject>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: i64,
    last_modified: DateTime<Utc>,
}

impl StoredObject {
    fn meta(&self, bucket: &str, key: &str) -> ObjectMeta {
        ObjectMeta {
            summary: ObjectSummary {
                bucket: bucket.to_string(),
                key: key.to_string(),
                etag: Some(format!("\"{}\"", self.version)),
                size: self.data.len() as u64,
                last_modified: Some(self.last_modified),
            },
            version: self.version.to_string(),
        }
    }
}

fn poison_err() -> Error {
    Error::Internal {
        message: "object store lock poisoned".into(),
    }
}

impl MemoryObjectStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let objects = self.objects.read().map_err(|_| poison_err())?;
        objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::NotFound(format!("object not found: {bucket}/{key}")))
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut objects = self.objects.write().map_err(|_| poison_err())?;
        let id = (bucket.to_string(), key.to_string());
        let current = objects.get(&id);

        match precondition {
            WritePrecondition::DoesNotExist => {
                if let Some(obj) = current {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: obj.version.to_string(),
                    });
                }
            }
            WritePrecondition::MatchesVersion(expected) => {
                let expected_num: i64 = expected.parse().unwrap_or(-1);
                match current {
                    Some(obj) if obj.version != expected_num => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: obj.version.to_string(),
                        });
                    }
                    None => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: "0".to_string(),
                        });
                    }
                    _ => {}
                }
            }
            WritePrecondition::None => {}
        }

        let new_version = current.map_or(1, |o| o.version + 1);
        objects.insert(
            id,
            StoredObject {
                data,
                version: new_version,
                last_modified: Utc::now(),
            },
        );
        drop(objects);

        Ok(WriteResult::Success {
            version: new_version.to_string(),
        })
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.objects
            .write()
            .map_err(|_| poison_err())?
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectSummary>> {
        let objects = self.objects.read().map_err(|_| poison_err())?;
        Ok(objects
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .map(|((b, k), obj)| obj.meta(b, k).summary)
            .collect())
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poison_err())?;
        Ok(objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|obj| obj.meta(bucket, key)))
    }
}
