//! Cluster-wide counting semaphore for singleton background work.
//!
//! Periodic jobs (partition maintenance, bucket scans) run on every worker but
//! must only execute on a bounded number of them at a time. Each job asks for a
//! lease on a named key with a maximum holder count and a timeout:
//!
//! 1. Read the holder list for the key together with its version
//! 2. Drop holders whose lease has expired
//! 3. If a slot is free, append our lease and write back with a CAS precondition
//! 4. A lost CAS race retries with backoff; a full holder list is "not acquired"
//!
//! Not acquiring is a normal outcome, never an error. Leases expire on their own,
//! so a crashed holder frees its slot after the timeout.
//!
//! # Example
//!
//! ```rust,ignore
//! let semaphore = ObjectStoreSemaphore::new(store, "coordination", "semaphores/");
//! let ran = run_exclusive(&semaphore, "TABLE_PARTITION_WORKER", Duration::from_secs(30), 1, async {
//!     // only one worker in the cluster gets here per tick
//! })
//! .await?;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::storage::{ObjectStore, WritePrecondition, WriteResult};

/// Maximum CAS attempts per acquire or release.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

const BACKOFF_BASE: Duration = Duration::from_millis(50);
const BACKOFF_MAX: Duration = Duration::from_secs(2);

/// A held slot of a counting semaphore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken {
    /// Semaphore key the lease was taken on.
    pub key: String,
    /// Unique token identifying this holder.
    pub token: String,
    /// When the lease lapses if not released.
    pub expires_at: DateTime<Utc>,
}

/// A named counting semaphore shared by all workers.
#[async_trait]
pub trait CountingSemaphore: Send + Sync + 'static {
    /// Tries to take one of `max_holders` slots on `key` for `timeout`.
    ///
    /// Returns `Ok(None)` when every slot is held.
    async fn try_acquire(
        &self,
        key: &str,
        timeout: Duration,
        max_holders: u32,
    ) -> Result<Option<LeaseToken>>;

    /// Releases a lease. Releasing an expired or unknown lease is a no-op.
    async fn release(&self, lease: &LeaseToken) -> Result<()>;
}

/// Runs `work` only if a slot on `key` can be acquired.
///
/// Returns `Ok(None)` without running `work` when the semaphore is full. The
/// lease is released once `work` completes; a failed release is logged and
/// left to expire.
///
/// # Errors
///
/// Returns an error if the semaphore state could not be read or written.
pub async fn run_exclusive<S, F, T>(
    semaphore: &S,
    key: &str,
    timeout: Duration,
    max_holders: u32,
    work: F,
) -> Result<Option<T>>
where
    S: CountingSemaphore + ?Sized,
    F: Future<Output = T> + Send,
{
    let Some(lease) = semaphore.try_acquire(key, timeout, max_holders).await? else {
        tracing::debug!(key, "semaphore slot not acquired");
        return Ok(None);
    };

    let output = work.await;

    if let Err(e) = semaphore.release(&lease).await {
        tracing::warn!(key, error = %e, "failed to release semaphore lease");
    }
    Ok(Some(output))
}

/// Holder list persisted per semaphore key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HolderList {
    holders: Vec<Holder>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Holder {
    token: String,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl HolderList {
    fn prune_expired(&mut self, now: DateTime<Utc>) {
        self.holders.retain(|h| h.expires_at > now);
    }
}

/// Counting semaphore backed by object storage.
///
/// One JSON holder list per key, updated only through conditional writes.
pub struct ObjectStoreSemaphore<S: ObjectStore + ?Sized> {
    storage: Arc<S>,
    bucket: String,
    prefix: String,
}

impl<S: ObjectStore + ?Sized> Clone for ObjectStoreSemaphore<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            bucket: self.bucket.clone(),
            prefix: self.prefix.clone(),
        }
    }
}

impl<S: ObjectStore + ?Sized> ObjectStoreSemaphore<S> {
    /// Creates a semaphore storing holder lists under `bucket/prefix`.
    #[must_use]
    pub fn new(storage: Arc<S>, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            storage,
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }

    fn object_key(&self, key: &str) -> String {
        format!("{}{key}.json", self.prefix)
    }

    /// Reads the holder list and the version it was read at.
    async fn read_holders(&self, object_key: &str) -> Result<(HolderList, Option<String>)> {
        // Version first, then contents: a concurrent writer makes the later CAS fail.
        let Some(meta) = self.storage.head(&self.bucket, object_key).await? else {
            return Ok((HolderList::default(), None));
        };
        match self.storage.get(&self.bucket, object_key).await {
            Ok(data) => {
                let list: HolderList =
                    serde_json::from_slice(&data).map_err(|e| Error::Serialization {
                        message: format!("parse semaphore holders: {e}"),
                    })?;
                Ok((list, Some(meta.version)))
            }
            Err(Error::NotFound(_)) => Ok((HolderList::default(), None)),
            Err(e) => Err(e),
        }
    }

    async fn write_holders(
        &self,
        object_key: &str,
        list: &HolderList,
        version: Option<String>,
    ) -> Result<WriteResult> {
        let bytes = Bytes::from(serde_json::to_vec(list).map_err(|e| Error::Serialization {
            message: format!("serialize semaphore holders: {e}"),
        })?);
        let precondition = version.map_or(
            WritePrecondition::DoesNotExist,
            WritePrecondition::MatchesVersion,
        );
        self.storage
            .put(&self.bucket, object_key, bytes, precondition)
            .await
    }
}

#[async_trait]
impl<S: ObjectStore + ?Sized> CountingSemaphore for ObjectStoreSemaphore<S> {
    async fn try_acquire(
        &self,
        key: &str,
        timeout: Duration,
        max_holders: u32,
    ) -> Result<Option<LeaseToken>> {
        if max_holders == 0 {
            return Err(Error::InvalidInput("max_holders must be positive".into()));
        }
        let object_key = self.object_key(key);
        let ttl = chrono::Duration::from_std(timeout)
            .map_err(|e| Error::InvalidInput(format!("semaphore timeout out of range: {e}")))?;
        let mut backoff = BACKOFF_BASE;

        for _ in 0..DEFAULT_MAX_RETRIES {
            let (mut list, version) = self.read_holders(&object_key).await?;
            let now = Utc::now();
            list.prune_expired(now);

            if list.holders.len() >= max_holders as usize {
                return Ok(None);
            }

            let lease = LeaseToken {
                key: key.to_string(),
                token: Ulid::new().to_string(),
                expires_at: now + ttl,
            };
            list.holders.push(Holder {
                token: lease.token.clone(),
                acquired_at: now,
                expires_at: lease.expires_at,
            });

            match self.write_holders(&object_key, &list, version).await? {
                WriteResult::Success { .. } => {
                    tracing::debug!(key, token = %lease.token, "semaphore slot acquired");
                    return Ok(Some(lease));
                }
                WriteResult::PreconditionFailed { .. } => {
                    let delay = backoff.min(BACKOFF_MAX) + Duration::from_millis(rand_jitter());
                    tokio::time::sleep(delay).await;
                    backoff = backoff.saturating_mul(2);
                }
            }
        }

        tracing::debug!(key, "semaphore contended, giving up this round");
        Ok(None)
    }

    async fn release(&self, lease: &LeaseToken) -> Result<()> {
        let object_key = self.object_key(&lease.key);
        let mut backoff = BACKOFF_BASE;

        for _ in 0..DEFAULT_MAX_RETRIES {
            let (mut list, version) = self.read_holders(&object_key).await?;
            let before = list.holders.len();
            list.holders.retain(|h| h.token != lease.token);
            if list.holders.len() == before || version.is_none() {
                return Ok(());
            }

            match self.write_holders(&object_key, &list, version).await? {
                WriteResult::Success { .. } => return Ok(()),
                WriteResult::PreconditionFailed { .. } => {
                    tokio::time::sleep(backoff.min(BACKOFF_MAX)).await;
                    backoff = backoff.saturating_mul(2);
                }
            }
        }

        Err(Error::PreconditionFailed {
            message: format!(
                "could not release semaphore '{}' after {DEFAULT_MAX_RETRIES} attempts",
                lease.key
            ),
        })
    }
}

fn rand_jitter() -> u64 {
    use std::time::SystemTime;
    let seed = u64::from(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos(),
    );
    seed % 25
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn semaphore() -> ObjectStoreSemaphore<MemoryObjectStore> {
        ObjectStoreSemaphore::new(Arc::new(MemoryObjectStore::new()), "coord", "semaphores/")
    }

    #[tokio::test]
    async fn test_single_slot_excludes_second_holder() {
        let sem = semaphore();
        let first = sem
            .try_acquire("JOB", Duration::from_secs(30), 1)
            .await
            .expect("acquire");
        assert!(first.is_some());

        let second = sem
            .try_acquire("JOB", Duration::from_secs(30), 1)
            .await
            .expect("acquire");
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_release_frees_slot() {
        let sem = semaphore();
        let lease = sem
            .try_acquire("JOB", Duration::from_secs(30), 1)
            .await
            .expect("acquire")
            .expect("slot");
        sem.release(&lease).await.expect("release");

        let again = sem
            .try_acquire("JOB", Duration::from_secs(30), 1)
            .await
            .expect("acquire");
        assert!(again.is_some());

        // Releasing twice is harmless.
        sem.release(&lease).await.expect("second release");
    }

    #[tokio::test]
    async fn test_expired_lease_is_pruned() {
        let sem = semaphore();
        let _stale = sem
            .try_acquire("JOB", Duration::from_millis(1), 1)
            .await
            .expect("acquire")
            .expect("slot");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let fresh = sem
            .try_acquire("JOB", Duration::from_secs(30), 1)
            .await
            .expect("acquire");
        assert!(fresh.is_some());
    }

    #[tokio::test]
    async fn test_counting_allows_max_holders() {
        let sem = semaphore();
        for _ in 0..3 {
            assert!(
                sem.try_acquire("SCAN", Duration::from_secs(30), 3)
                    .await
                    .expect("acquire")
                    .is_some()
            );
        }
        assert!(
            sem.try_acquire("SCAN", Duration::from_secs(30), 3)
                .await
                .expect("acquire")
                .is_none()
        );
        // Other keys are independent.
        assert!(
            sem.try_acquire("OTHER", Duration::from_secs(30), 1)
                .await
                .expect("acquire")
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_zero_max_holders_rejected() {
        let sem = semaphore();
        let result = sem.try_acquire("JOB", Duration::from_secs(1), 0).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_run_exclusive_skips_when_held() {
        let sem = semaphore();
        let runs = AtomicU32::new(0);

        let _held = sem
            .try_acquire("JOB", Duration::from_secs(30), 1)
            .await
            .expect("acquire")
            .expect("slot");

        let skipped = run_exclusive(&sem, "JOB", Duration::from_secs(30), 1, async {
            runs.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .expect("run");
        assert!(skipped.is_none());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_exclusive_releases_after_work() {
        let sem = semaphore();
        let out = run_exclusive(&sem, "JOB", Duration::from_secs(30), 1, async { 7 })
            .await
            .expect("run");
        assert_eq!(out, Some(7));

        let next = run_exclusive(&sem, "JOB", Duration::from_secs(30), 1, async { 8 })
            .await
            .expect("run");
        assert_eq!(next, Some(8));
    }
}
