//! Periodic full scan of watched buckets.
//!
//! Catches objects whose notifications were lost. Gated by the
//! `BUCKET_SCANNER_WORKER` semaphore so one worker scans at a time.

use std::sync::Arc;
use std::time::Duration;

use strata_core::{CountingSemaphore, ObjectStore, run_exclusive};
use strata_store::DiscoveryBackend;

use crate::error::{Error, Result};
use crate::file_manager::{AddSummary, FileManager};

/// Semaphore key gating bucket scans.
pub const BUCKET_SCANNER_WORKER: &str = "BUCKET_SCANNER_WORKER";

/// Scanner settings.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Buckets to enumerate.
    pub buckets: Vec<String>,
    /// Lease duration on the semaphore slot.
    pub lock_timeout: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            buckets: Vec::new(),
            lock_timeout: Duration::from_secs(60),
        }
    }
}

/// Result of one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Another worker holds the slot.
    Skipped,
    /// Buckets were enumerated.
    Completed(AddSummary),
}

/// Enumerates buckets and feeds every object to a [`FileManager`].
pub struct BucketScanner<O, B, L>
where
    O: ObjectStore + ?Sized,
    B: DiscoveryBackend + ?Sized,
    L: CountingSemaphore + ?Sized,
{
    storage: Arc<O>,
    files: Arc<FileManager<B>>,
    semaphore: Arc<L>,
    config: ScannerConfig,
}

impl<O, B, L> BucketScanner<O, B, L>
where
    O: ObjectStore + ?Sized,
    B: DiscoveryBackend + ?Sized,
    L: CountingSemaphore + ?Sized,
{
    /// Creates a scanner.
    #[must_use]
    pub fn new(
        storage: Arc<O>,
        files: Arc<FileManager<B>>,
        semaphore: Arc<L>,
        config: ScannerConfig,
    ) -> Self {
        Self {
            storage,
            files,
            semaphore,
            config,
        }
    }

    /// Scans every configured bucket if the scanner slot is free.
    ///
    /// # Errors
    ///
    /// Returns an error if listing, discovery writes or the semaphore fail.
    pub async fn scan(&self) -> Result<ScanOutcome> {
        let ran = run_exclusive(
            self.semaphore.as_ref(),
            BUCKET_SCANNER_WORKER,
            self.config.lock_timeout,
            1,
            self.scan_all(),
        )
        .await
        .map_err(Error::Core)?;

        match ran {
            Some(summary) => Ok(ScanOutcome::Completed(summary?)),
            None => {
                tracing::debug!("bucket scan skipped; slot held elsewhere");
                Ok(ScanOutcome::Skipped)
            }
        }
    }

    /// Scans every `interval`, starting immediately. Failures are logged and
    /// retried on the next tick.
    pub async fn run_loop(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match self.scan().await {
                Ok(ScanOutcome::Completed(summary)) => {
                    tracing::info!(
                        seen = summary.seen,
                        new = summary.new,
                        submitted = summary.submitted,
                        "bucket scan completed"
                    );
                }
                Ok(ScanOutcome::Skipped) => {}
                Err(e) => tracing::error!(error = %e, "bucket scan failed"),
            }
        }
    }

    async fn scan_all(&self) -> Result<AddSummary> {
        let mut total = AddSummary::default();
        for bucket in &self.config.buckets {
            let objects = self.storage.list(bucket, "").await?;
            tracing::info!(bucket = %bucket, objects = objects.len(), "scanning bucket");
            let added = self.files.add_objects(&objects, "scan").await?;
            total.seen += added.seen;
            total.new += added.new;
            total.submitted += added.submitted;
        }
        Ok(total)
    }
}
