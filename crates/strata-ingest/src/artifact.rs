//! Submission messages and artifact download.
//!
//! An artifact is downloaded into a [`tempfile::NamedTempFile`]. The file is
//! removed when the handle drops, so every exit path of a handler (success,
//! deferral, error, panic unwind) cleans it up.

use std::path::Path;

use serde::{Deserialize, Serialize};
use strata_core::ObjectStore;
use tempfile::NamedTempFile;

use crate::error::{Error, Result};

/// Names one artifact to ingest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionMessage {
    /// Bucket holding the artifact.
    pub bucket: String,
    /// Artifact key.
    pub key: String,
}

impl SubmissionMessage {
    /// Creates a submission.
    #[must_use]
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Decodes a queue message body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedMessage`] if the body is not a submission or
    /// names an empty bucket or key.
    pub fn decode(body: &str) -> Result<Self> {
        let message: Self = serde_json::from_str(body)
            .map_err(|e| Error::malformed(format!("invalid submission body: {e}")))?;
        if message.bucket.trim().is_empty() || message.key.trim().is_empty() {
            return Err(Error::malformed("submission names an empty bucket or key"));
        }
        Ok(message)
    }

    /// Encodes the message as a queue body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedMessage`] if serialization fails.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::malformed(format!("failed to encode submission: {e}")))
    }
}

/// Downloads an object into a fresh temporary file.
///
/// The temporary file is created before the download starts and dropped (and
/// so removed) if the download fails.
///
/// # Errors
///
/// Returns an error if the temp file cannot be created or written, or if the
/// object cannot be fetched.
pub async fn fetch_to_temp_file<S: ObjectStore + ?Sized>(
    storage: &S,
    bucket: &str,
    key: &str,
    prefix: &str,
    temp_dir: Option<&Path>,
) -> Result<NamedTempFile> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(prefix).suffix(".jsonl");
    let file = match temp_dir {
        Some(dir) => builder.tempfile_in(dir),
        None => builder.tempfile(),
    }
    .map_err(|e| Error::io("failed to create temp file", e))?;

    tracing::debug!(bucket, key, path = %file.path().display(), "downloading artifact");
    let data = storage.get(bucket, key).await?;
    tokio::fs::write(file.path(), &data)
        .await
        .map_err(|e| Error::io(format!("failed to write {}", file.path().display()), e))?;
    tracing::debug!(bucket, key, bytes = data.len(), "download completed");

    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use strata_core::{MemoryObjectStore, WritePrecondition};

    #[test]
    fn decode_requires_bucket_and_key() {
        let ok = SubmissionMessage::decode(r#"{"bucket":"b","key":"k"}"#).unwrap();
        assert_eq!(ok, SubmissionMessage::new("b", "k"));

        assert!(matches!(
            SubmissionMessage::decode("<xml/>"),
            Err(Error::MalformedMessage { .. })
        ));
        assert!(matches!(
            SubmissionMessage::decode(r#"{"bucket":"","key":"k"}"#),
            Err(Error::MalformedMessage { .. })
        ));
    }

    #[tokio::test]
    async fn fetch_writes_object_into_temp_dir() {
        let store = MemoryObjectStore::new();
        store
            .put(
                "b",
                "k.jsonl",
                Bytes::from_static(b"line\n"),
                WritePrecondition::None,
            )
            .await
            .unwrap();
        let dir = tempfile::tempdir().unwrap();

        let file = fetch_to_temp_file(&store, "b", "k.jsonl", "artifact", Some(dir.path()))
            .await
            .unwrap();
        let path = file.path().to_path_buf();
        assert!(path.starts_with(dir.path()));
        assert_eq!(std::fs::read(&path).unwrap(), b"line\n");

        drop(file);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn failed_fetch_leaves_no_file() {
        let store = MemoryObjectStore::new();
        let dir = tempfile::tempdir().unwrap();

        let result = fetch_to_temp_file(&store, "b", "missing", "artifact", Some(dir.path())).await;
        assert!(matches!(result, Err(Error::Core(_))));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
