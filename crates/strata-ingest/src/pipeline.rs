//! Queue-driven ingestion of one artifact into a partitioned fact table.
//!
//! # Flow
//!
//! ```text
//! Received → Downloading → Streaming → Admitted* → Writing* → Done
//! ```
//!
//! A partition check that fails exits to `Deferred`; I/O, storage and store
//! errors exit to `Failed` from any later stage.
//!
//! Rows are admitted only if the partitions covering their timestamps already
//! exist. The artifact is read once to check every target partition before
//! any batch is written, so a missing partition defers the whole message with
//! zero rows written. The message is redelivered after maintenance has had a
//! chance to provision the partition. Lines that do not decode and records
//! that fail conversion are dropped, not the message.
//!
//! The artifact lives in a temp file owned by the handler; it is removed on
//! every exit path.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use strata_core::observability::ingestion_span;
use strata_core::partition::partition_name;
use strata_core::ObjectStore;
use strata_store::{InsertBatch, PartitionManager, RecordSink, SchemaBackend};
use tracing::Instrument;

use crate::artifact::{fetch_to_temp_file, SubmissionMessage};
use crate::error::{Error, Result};
use crate::metrics::{self, FlushTimer};
use crate::queue::{ProgressReporter, QueueMessage};
use crate::reader::{ArtifactLine, RecordReader};
use crate::snapshot::SnapshotKind;

/// Default rows per insert batch.
pub const DEFAULT_BATCH_SIZE: usize = 25_000;

/// Pipeline settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Rows per insert batch.
    pub batch_size: usize,
    /// Directory for temporary artifact files; the system default when `None`.
    pub temp_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            temp_dir: None,
        }
    }
}

/// Where a message is in its processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStage {
    /// Message taken from the queue.
    Received,
    /// Artifact being fetched into a temp file.
    Downloading,
    /// Raw records being read and converted.
    Streaming,
    /// A row's partition was found provisioned.
    Admitted,
    /// A batch is being written.
    Writing,
    /// All rows written.
    Done,
}

impl fmt::Display for IngestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Received => "received",
            Self::Downloading => "downloading",
            Self::Streaming => "streaming",
            Self::Admitted => "admitted",
            Self::Writing => "writing",
            Self::Done => "done",
        })
    }
}

/// Result of handling one message.
#[derive(Debug)]
pub enum IngestOutcome {
    /// Every row was admitted and written.
    Accepted {
        /// Rows admitted; duplicates ignored by the store are included, so the
        /// count is the same on every delivery.
        rows: u64,
    },
    /// A row's partition is not provisioned yet; retry later.
    Deferred {
        /// Target table.
        table: String,
        /// The missing partition.
        partition: String,
    },
    /// The message cannot be processed.
    Failed(Error),
}

/// What the worker does with a message after handling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDisposition {
    /// Remove the message from the queue.
    Delete,
    /// Make the message visible again after the retry delay.
    Release,
    /// Touch nothing; the delivery lapses with its visibility timeout and the
    /// queue's redelivery policy takes over.
    Abandon,
}

impl IngestOutcome {
    /// Returns true for [`IngestOutcome::Accepted`].
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    /// Returns true for [`IngestOutcome::Deferred`].
    #[must_use]
    pub const fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred { .. })
    }

    /// Returns true for [`IngestOutcome::Failed`].
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Accepted messages and permanent failures are deleted, deferred ones
    /// released and transient failures abandoned to the queue.
    #[must_use]
    pub fn disposition(&self) -> MessageDisposition {
        match self {
            Self::Accepted { .. } => MessageDisposition::Delete,
            Self::Deferred { .. } => MessageDisposition::Release,
            Self::Failed(e) if e.is_permanent() => MessageDisposition::Delete,
            Self::Failed(_) => MessageDisposition::Abandon,
        }
    }

    /// Metric label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Accepted { .. } => "accepted",
            Self::Deferred { .. } => "deferred",
            Self::Failed(_) => "failed",
        }
    }
}

/// Handles one queue message.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Processes `message`, signalling liveness through `progress`.
    async fn handle(&self, message: &QueueMessage, progress: &dyn ProgressReporter)
        -> IngestOutcome;
}

#[derive(Debug, Default)]
struct IngestStats {
    rows: u64,
    dropped: u64,
    inserted: u64,
    batches: u64,
}

/// Ingests artifacts of one [`SnapshotKind`].
pub struct IngestionPipeline<O, B, S>
where
    O: ObjectStore + ?Sized,
    B: SchemaBackend + ?Sized,
    S: RecordSink + ?Sized,
{
    kind: SnapshotKind,
    storage: Arc<O>,
    partitions: Arc<PartitionManager<B>>,
    sink: Arc<S>,
    config: PipelineConfig,
}

impl<O, B, S> IngestionPipeline<O, B, S>
where
    O: ObjectStore + ?Sized,
    B: SchemaBackend + ?Sized,
    S: RecordSink + ?Sized,
{
    /// Creates a pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the batch size is zero.
    pub fn new(
        kind: SnapshotKind,
        storage: Arc<O>,
        partitions: Arc<PartitionManager<B>>,
        sink: Arc<S>,
        config: PipelineConfig,
    ) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::InvalidInput("batch size must be positive".into()));
        }
        Ok(Self {
            kind,
            storage,
            partitions,
            sink,
            config,
        })
    }

    /// The kind of artifact this pipeline ingests.
    #[must_use]
    pub const fn kind(&self) -> SnapshotKind {
        self.kind
    }

    /// Processes one message end to end.
    pub async fn run_ingestion(
        &self,
        message: &QueueMessage,
        progress: &dyn ProgressReporter,
    ) -> IngestOutcome {
        progress.progress_made().await;
        tracing::debug!(
            stage = %IngestStage::Received,
            message_id = %message.message_id,
            receive_count = message.receive_count
        );

        let outcome = match SubmissionMessage::decode(&message.body) {
            Ok(submission) => {
                let span = ingestion_span(self.kind.as_str(), &submission.bucket, &submission.key);
                self.ingest(&submission, progress).instrument(span).await
            }
            Err(e) => IngestOutcome::Failed(e),
        };

        match &outcome {
            IngestOutcome::Accepted { rows } => {
                tracing::info!(kind = %self.kind, rows, message_id = %message.message_id, "message accepted");
            }
            IngestOutcome::Deferred { table, partition } => {
                tracing::info!(
                    kind = %self.kind,
                    table = %table,
                    partition = %partition,
                    message_id = %message.message_id,
                    "partition not provisioned; deferring message"
                );
            }
            IngestOutcome::Failed(e) => {
                tracing::error!(kind = %self.kind, message_id = %message.message_id, error = %e, "message failed");
            }
        }
        metrics::record_message(self.kind.as_str(), outcome.label());
        outcome
    }

    async fn ingest(
        &self,
        submission: &SubmissionMessage,
        progress: &dyn ProgressReporter,
    ) -> IngestOutcome {
        let mut stats = IngestStats::default();
        let outcome = match self.try_ingest(submission, progress, &mut stats).await {
            Ok(outcome) => outcome,
            Err(e) => IngestOutcome::Failed(e),
        };
        if outcome.is_accepted() {
            metrics::record_rows(self.kind.as_str(), stats.rows, stats.dropped);
        }
        tracing::debug!(
            rows = stats.rows,
            dropped = stats.dropped,
            inserted = stats.inserted,
            batches = stats.batches,
            "ingestion finished"
        );
        outcome
    }

    async fn try_ingest(
        &self,
        submission: &SubmissionMessage,
        progress: &dyn ProgressReporter,
        stats: &mut IngestStats,
    ) -> Result<IngestOutcome> {
        let table = self.kind.table();

        tracing::debug!(stage = %IngestStage::Downloading);
        let file = fetch_to_temp_file(
            self.storage.as_ref(),
            &submission.bucket,
            &submission.key,
            self.kind.temp_file_prefix(),
            self.config.temp_dir.as_deref(),
        )
        .await?;

        tracing::debug!(stage = %IngestStage::Streaming);
        if let Some(partition) = self.first_missing_partition(file.path()).await? {
            return Ok(IngestOutcome::Deferred {
                table: table.to_string(),
                partition,
            });
        }

        let columns = self
            .kind
            .definition()
            .columns
            .iter()
            .map(|c| c.name.clone())
            .collect();
        let mut batch = InsertBatch::new(table, columns);
        let mut reader = RecordReader::open(file.path(), self.kind).await?;

        while let Some(line) = reader.next_line().await? {
            let raw = match line {
                ArtifactLine::Record(raw) => raw,
                ArtifactLine::Unreadable { line, message } => {
                    stats.dropped += 1;
                    tracing::warn!(line, error = %message, "dropping unreadable line");
                    continue;
                }
            };
            let Some(rows) = self.kind.convert(&raw) else {
                stats.dropped += 1;
                tracing::warn!(line = reader.line_number(), "dropping invalid record");
                continue;
            };

            for row in rows {
                batch.push(row.values)?;
                stats.rows += 1;
                if batch.len() >= self.config.batch_size {
                    self.flush(&mut batch, progress, stats).await?;
                }
            }
        }

        if !batch.is_empty() {
            self.flush(&mut batch, progress, stats).await?;
        }
        tracing::debug!(stage = %IngestStage::Done);
        Ok(IngestOutcome::Accepted { rows: stats.rows })
    }

    /// Reads the artifact once and checks every distinct partition its rows
    /// target, earliest first. Nothing is written before all of them exist.
    async fn first_missing_partition(&self, path: &Path) -> Result<Option<String>> {
        let period = self.kind.period();
        let mut reader = RecordReader::open(path, self.kind).await?;
        let mut targets: BTreeMap<String, DateTime<Utc>> = BTreeMap::new();

        while let Some(line) = reader.next_line().await? {
            let ArtifactLine::Record(raw) = line else {
                continue;
            };
            for row in self.kind.convert(&raw).into_iter().flatten() {
                targets
                    .entry(partition_name(row.partition_time, period))
                    .or_insert(row.partition_time);
            }
        }

        for (partition, at) in targets {
            if !self
                .partitions
                .partition_exists_for(self.kind.table(), at, period)
                .await?
            {
                return Ok(Some(partition));
            }
            tracing::debug!(stage = %IngestStage::Admitted, partition = %partition);
        }
        Ok(None)
    }

    async fn flush(
        &self,
        batch: &mut InsertBatch,
        progress: &dyn ProgressReporter,
        stats: &mut IngestStats,
    ) -> Result<()> {
        let pending = batch.take();
        tracing::debug!(stage = %IngestStage::Writing, rows = pending.len());
        let timer = FlushTimer::start(&pending.table);
        let inserted = self.sink.insert_ignore(&pending).await?;
        timer.finish();

        stats.inserted += inserted;
        stats.batches += 1;
        progress.progress_made().await;
        Ok(())
    }
}

#[async_trait]
impl<O, B, S> MessageHandler for IngestionPipeline<O, B, S>
where
    O: ObjectStore + ?Sized,
    B: SchemaBackend + ?Sized,
    S: RecordSink + ?Sized,
{
    async fn handle(
        &self,
        message: &QueueMessage,
        progress: &dyn ProgressReporter,
    ) -> IngestOutcome {
        self.run_ingestion(message, progress).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispositions() {
        assert_eq!(
            IngestOutcome::Accepted { rows: 1 }.disposition(),
            MessageDisposition::Delete
        );
        assert_eq!(
            IngestOutcome::Failed(Error::malformed("x")).disposition(),
            MessageDisposition::Delete
        );
        assert_eq!(
            IngestOutcome::Failed(Error::queue("timed out")).disposition(),
            MessageDisposition::Abandon
        );
        let deferred = IngestOutcome::Deferred {
            table: "T".into(),
            partition: "p20240101".into(),
        };
        assert!(deferred.is_deferred());
        assert_eq!(deferred.disposition(), MessageDisposition::Release);
        assert_eq!(deferred.label(), "deferred");
    }

    #[test]
    fn default_batch_size() {
        assert_eq!(PipelineConfig::default().batch_size, 25_000);
    }

    #[test]
    fn stage_names() {
        assert_eq!(IngestStage::Downloading.to_string(), "downloading");
        assert_eq!(IngestStage::Done.to_string(), "done");
    }
}
