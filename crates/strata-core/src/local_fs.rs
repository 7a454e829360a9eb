//! Object store over a local directory tree.
//!
//! Each bucket is a directory under the root and each key a relative path
//! inside it. Writes land in a temp file that is renamed over the target, so
//! readers never observe a partial object. Conditional writes are serialized
//! by an in-process lock only; workers sharing one root from several processes
//! must coordinate through a database-backed semaphore.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::storage::{ObjectMeta, ObjectStore, ObjectSummary, WritePrecondition, WriteResult};

/// Prefix of in-flight write files; never listed.
const TEMP_PREFIX: &str = ".strata-tmp-";

/// Object store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalFsObjectStore {
    root: PathBuf,
    writes: Arc<Mutex<()>>,
}

impl LocalFsObjectStore {
    /// Creates a store rooted at `root`. The directory is created on first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            writes: Arc::new(Mutex::new(())),
        }
    }

    /// The root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_path(&self, bucket: &str) -> Result<PathBuf> {
        if bucket.is_empty() || bucket.contains(['/', '\\']) || bucket == "." || bucket == ".." {
            return Err(Error::InvalidInput(format!("invalid bucket name: {bucket:?}")));
        }
        Ok(self.root.join(bucket))
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let plain = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || key.ends_with('/') || !plain {
            return Err(Error::InvalidInput(format!("invalid object key: {key:?}")));
        }
        Ok(self.bucket_path(bucket)?.join(relative))
    }
}

fn io_err(context: &str, path: &Path) -> impl FnOnce(std::io::Error) -> Error {
    let message = format!("{context}: {}", path.display());
    move |e| Error::storage_with_source(message, e)
}

fn meta_from(bucket: &str, key: &str, metadata: &std::fs::Metadata) -> ObjectMeta {
    let modified = metadata.modified().ok();
    let nanos = modified
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_nanos());
    let version = format!("{nanos:x}-{:x}", metadata.len());
    ObjectMeta {
        summary: ObjectSummary {
            bucket: bucket.to_string(),
            key: key.to_string(),
            etag: Some(format!("\"{version}\"")),
            size: metadata.len(),
            last_modified: modified.map(DateTime::<Utc>::from),
        },
        version,
    }
}

/// Joins the components of `relative` with `/`; `None` for non-UTF-8 names.
fn key_of(relative: &Path) -> Option<String> {
    let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
    parts.map(|parts| parts.join("/"))
}

#[async_trait]
impl ObjectStore for LocalFsObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let path = self.object_path(bucket, key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::IsADirectory) => {
                Err(Error::NotFound(format!("object not found: {bucket}/{key}")))
            }
            Err(e) => Err(io_err("read object", &path)(e)),
        }
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let path = self.object_path(bucket, key)?;
        let _guard = self.writes.lock().await;

        let current = self.head(bucket, key).await?;
        match (&precondition, &current) {
            (WritePrecondition::DoesNotExist, Some(meta)) => {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: meta.version.clone(),
                });
            }
            (WritePrecondition::MatchesVersion(expected), Some(meta)) if *expected != meta.version => {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: meta.version.clone(),
                });
            }
            (WritePrecondition::MatchesVersion(_), None) => {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: "0".to_string(),
                });
            }
            _ => {}
        }

        let parent = path
            .parent()
            .ok_or_else(|| Error::InvalidInput(format!("invalid object key: {key:?}")))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(io_err("create object directory", parent))?;

        let temp = parent.join(format!("{TEMP_PREFIX}{}", Ulid::new()));
        if let Err(e) = tokio::fs::write(&temp, &data).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(io_err("write object", &temp)(e));
        }
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(io_err("publish object", &path)(e));
        }

        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(io_err("stat object", &path))?;
        Ok(WriteResult::Success {
            version: meta_from(bucket, key, &metadata).version,
        })
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let path = self.object_path(bucket, key)?;
        let _guard = self.writes.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err("delete object", &path)(e)),
        }
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectSummary>> {
        let bucket_dir = self.bucket_path(bucket)?;
        let mut pending = vec![bucket_dir.clone()];
        let mut listed = Vec::new();

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(io_err("list directory", &dir)(e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(io_err("list directory", &dir))?
            {
                let path = entry.path();
                let metadata = entry
                    .metadata()
                    .await
                    .map_err(io_err("stat entry", &path))?;
                if metadata.is_dir() {
                    pending.push(path);
                    continue;
                }
                if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                    continue;
                }
                let Some(key) = path.strip_prefix(&bucket_dir).ok().and_then(key_of) else {
                    tracing::warn!(path = %path.display(), "skipping object with a non-UTF-8 name");
                    continue;
                };
                if key.starts_with(prefix) {
                    listed.push(meta_from(bucket, &key, &metadata).summary);
                }
            }
        }

        listed.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(listed)
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>> {
        let path = self.object_path(bucket, key)?;
        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Ok(Some(meta_from(bucket, key, &metadata))),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err("stat object", &path)(e)),
        }
    }
}
