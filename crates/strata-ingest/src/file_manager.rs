//! Reconciles object sightings from notifications and bucket scans.
//!
//! Both producers feed the same [`FileManager::add_objects`]. An object already
//! tracked is skipped, so whichever producer sees it first does the work and
//! the other converges on the same discovery row.

use std::sync::Arc;

use chrono::Utc;
use strata_core::ObjectSummary;
use strata_store::{DiscoveryBackend, DiscoveryStateStore, FolderRecord, FolderState};

use crate::artifact::SubmissionMessage;
use crate::error::Result;
use crate::metrics;
use crate::notification::parse_event_json;
use crate::queue::MessageQueue;
use crate::snapshot::SnapshotKind;
use crate::worker::{PollSummary, WorkerPoolConfig};

/// Sends artifacts whose key contains a path segment to a kind's queue.
#[derive(Clone)]
pub struct SnapshotRoute {
    /// Path segment that identifies the artifact stream, e.g. `teamMemberSnapshots`.
    pub segment: String,
    /// Kind ingested from the stream.
    pub kind: SnapshotKind,
    /// Queue feeding the kind's pipeline.
    pub queue: Arc<dyn MessageQueue>,
}

impl SnapshotRoute {
    /// Routes `kind`'s key segment to `queue`.
    #[must_use]
    pub fn for_kind(kind: SnapshotKind, queue: Arc<dyn MessageQueue>) -> Self {
        Self {
            segment: kind.key_segment().to_string(),
            kind,
            queue,
        }
    }

    /// Returns true if `key` has a path segment equal to this route's segment.
    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        key.split('/').any(|segment| segment == self.segment)
    }
}

/// Counts from one call to [`FileManager::add_objects`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddSummary {
    /// Objects offered.
    pub seen: usize,
    /// Objects tracked for the first time.
    pub new: usize,
    /// Submissions enqueued.
    pub submitted: usize,
}

/// Tracks discovered objects and submits them for ingestion.
pub struct FileManager<B: DiscoveryBackend + ?Sized> {
    discovery: DiscoveryStateStore<B>,
    routes: Vec<SnapshotRoute>,
}

impl<B: DiscoveryBackend + ?Sized> FileManager<B> {
    /// Creates a file manager.
    #[must_use]
    pub fn new(discovery: DiscoveryStateStore<B>, routes: Vec<SnapshotRoute>) -> Self {
        Self { discovery, routes }
    }

    /// The underlying discovery store.
    #[must_use]
    pub const fn discovery(&self) -> &DiscoveryStateStore<B> {
        &self.discovery
    }

    /// Records new objects, marks their folders as rolling and enqueues
    /// routed submissions. Folder markers (keys ending in `/`) are ignored.
    ///
    /// # Errors
    ///
    /// Returns the first store or queue failure; objects handled before it stay
    /// recorded.
    pub async fn add_objects(
        &self,
        objects: &[ObjectSummary],
        source: &'static str,
    ) -> Result<AddSummary> {
        let mut summary = AddSummary {
            seen: objects.len(),
            ..AddSummary::default()
        };

        for object in objects {
            if object.key.ends_with('/') {
                continue;
            }
            if self.discovery.exists(&object.bucket, &object.key).await? {
                continue;
            }

            // An object is tracked only once its submission is enqueued.
            if let Some(route) = self.routes.iter().find(|r| r.matches(&object.key)) {
                let body = SubmissionMessage::new(&object.bucket, &object.key).encode()?;
                route.queue.send(body).await?;
                summary.submitted += 1;
                tracing::debug!(bucket = %object.bucket, key = %object.key, kind = %route.kind, "submitted for ingestion");
            }

            self.discovery
                .get_or_create(&object.bucket, &object.key)
                .await?;
            summary.new += 1;

            if let Some(path) = parent_folder(&object.key) {
                self.discovery
                    .upsert_folder(&FolderRecord {
                        bucket: object.bucket.clone(),
                        path: path.to_string(),
                        state: FolderState::Rolling,
                        updated_on: Utc::now(),
                    })
                    .await?;
            }
        }

        metrics::record_discovered(source, u64::try_from(summary.new).unwrap_or(u64::MAX));
        tracing::info!(
            source,
            seen = summary.seen,
            new = summary.new,
            submitted = summary.submitted,
            "objects added"
        );
        Ok(summary)
    }

    /// Handles one storage event notification body.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed bodies and for store or queue failures.
    pub async fn handle_notification(&self, body: &str) -> Result<AddSummary> {
        let objects = parse_event_json(body)?;
        self.add_objects(&objects, "notification").await
    }
}

/// Drains a queue of storage event notifications into a [`FileManager`].
///
/// Handled and malformed notifications are deleted. A notification that hits
/// a store or queue failure is left to lapse back onto the queue.
pub struct NotificationConsumer<Q: MessageQueue + ?Sized, B: DiscoveryBackend + ?Sized> {
    queue: Arc<Q>,
    files: Arc<FileManager<B>>,
    config: WorkerPoolConfig,
}

impl<Q: MessageQueue + ?Sized, B: DiscoveryBackend + ?Sized> NotificationConsumer<Q, B> {
    /// Creates a consumer.
    #[must_use]
    pub fn new(queue: Arc<Q>, files: Arc<FileManager<B>>, config: WorkerPoolConfig) -> Self {
        Self {
            queue,
            files,
            config,
        }
    }

    /// Receives one round of notifications and handles them in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the receive itself fails.
    pub async fn poll_once(&self) -> Result<PollSummary> {
        let messages = self
            .queue
            .receive(self.config.max_messages, self.config.visibility_timeout)
            .await?;
        let mut summary = PollSummary {
            received: messages.len(),
            ..PollSummary::default()
        };

        for message in messages {
            let delete = match self.files.handle_notification(&message.body).await {
                Ok(_) => {
                    summary.accepted += 1;
                    true
                }
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(message_id = %message.message_id, error = %e, "notification failed");
                    e.is_permanent()
                }
            };
            if delete {
                if let Err(e) = self.queue.delete(&message.receipt).await {
                    tracing::warn!(message_id = %message.message_id, error = %e, "failed to delete notification");
                }
            }
        }
        Ok(summary)
    }

    /// Polls forever, sleeping when the queue is empty or unreachable.
    pub async fn run(&self) {
        loop {
            match self.poll_once().await {
                Ok(summary) if summary.received > 0 => {
                    tracing::debug!(
                        received = summary.received,
                        handled = summary.accepted,
                        failed = summary.failed,
                        "notifications polled"
                    );
                }
                Ok(_) => tokio::time::sleep(self.config.idle_interval).await,
                Err(e) => {
                    tracing::error!(error = %e, "failed to receive notifications");
                    tokio::time::sleep(self.config.idle_interval).await;
                }
            }
        }
    }
}

/// Parent folder of a key, with a trailing slash; `None` at the bucket root.
#[must_use]
pub fn parent_folder(key: &str) -> Option<&str> {
    key.rfind('/').map(|i| &key[..=i])
}
