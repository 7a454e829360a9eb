//! # strata-ingest
//!
//! Queue-driven ingestion for Strata.
//!
//! - **Pipeline**: Downloads an artifact, converts its raw records, admits rows
//!   only into provisioned partitions and writes them in insert-ignore batches
//! - **Worker pool**: Drains a message queue, applying each outcome's disposition
//! - **Partition maintenance**: Singleton job keeping partitions ahead of now
//! - **Discovery producers**: Event notifications and bucket scans feeding the
//!   discovery state store and the ingestion queues
//!
//! ## Outcomes
//!
//! | Outcome    | Queue action                                      |
//! |------------|---------------------------------------------------|
//! | `Accepted` | delete                                            |
//! | `Deferred` | release after the retry delay                     |
//! | `Failed`   | delete if permanent, else left for the queue to redeliver |

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod artifact;
pub mod error;
pub mod file_manager;
pub mod maintenance;
pub mod metrics;
pub mod notification;
pub mod pipeline;
pub mod queue;
pub mod reader;
pub mod records;
pub mod scanner;
pub mod snapshot;
pub mod worker;

pub use artifact::SubmissionMessage;
pub use error::{Error, Result};
pub use file_manager::{AddSummary, FileManager, NotificationConsumer, SnapshotRoute};
pub use maintenance::{
    MaintenanceConfig, MaintenanceOutcome, ManagedTable, PartitionMaintenanceJob,
    TABLE_PARTITION_WORKER,
};
pub use pipeline::{
    DEFAULT_BATCH_SIZE, IngestOutcome, IngestStage, IngestionPipeline, MessageDisposition,
    MessageHandler, PipelineConfig,
};
pub use queue::{InMemoryQueue, MessageQueue, ProgressReporter, QueueHeartbeat, QueueMessage};
pub use scanner::{BUCKET_SCANNER_WORKER, BucketScanner, ScanOutcome, ScannerConfig};
pub use snapshot::SnapshotKind;
pub use worker::{IngestWorker, PollSummary, WorkerPoolConfig};
