//! Message queue abstraction with visibility-timeout semantics.
//!
//! Workers receive messages, which become invisible to other receivers for a
//! visibility timeout. A message is gone only once deleted by the receipt of
//! its current delivery; otherwise it reappears when the timeout lapses. Each
//! delivery gets a fresh receipt, so a slow worker whose delivery already
//! lapsed cannot delete the message out from under the next receiver.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use strata_store::MySqlQueue;
use tokio::time::Instant;
use ulid::Ulid;

use crate::error::{Error, Result};

/// One delivery of a queued message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Stable identifier of the message across deliveries.
    pub message_id: String,
    /// Handle for this delivery; used for heartbeat, delete and release.
    pub receipt: String,
    /// Message body.
    pub body: String,
    /// How many times the message has been delivered, including this one.
    pub receive_count: u32,
}

/// A work queue with at-least-once delivery.
#[async_trait]
pub trait MessageQueue: Send + Sync + 'static {
    /// Enqueues a message body and returns its message id.
    async fn send(&self, body: String) -> Result<String>;

    /// Receives up to `max` visible messages, hiding them for `visibility`.
    async fn receive(&self, max: usize, visibility: Duration) -> Result<Vec<QueueMessage>>;

    /// Extends the invisibility of a delivery to `visibility` from now.
    async fn heartbeat(&self, receipt: &str, visibility: Duration) -> Result<()>;

    /// Deletes the message behind a delivery.
    async fn delete(&self, receipt: &str) -> Result<()>;

    /// Gives a delivery back; the message becomes visible again after `delay`.
    async fn release(&self, receipt: &str, delay: Duration) -> Result<()>;
}

/// Receives "still working" signals from long-running message handlers.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    /// Signals that the handler is making progress.
    async fn progress_made(&self);
}

/// Progress reporter that extends a queue delivery's visibility.
pub struct QueueHeartbeat<Q: MessageQueue + ?Sized> {
    queue: Arc<Q>,
    receipt: String,
    visibility: Duration,
}

impl<Q: MessageQueue + ?Sized> QueueHeartbeat<Q> {
    /// Creates a heartbeat for one delivery.
    #[must_use]
    pub fn new(queue: Arc<Q>, receipt: impl Into<String>, visibility: Duration) -> Self {
        Self {
            queue,
            receipt: receipt.into(),
            visibility,
        }
    }
}

#[async_trait]
impl<Q: MessageQueue + ?Sized> ProgressReporter for QueueHeartbeat<Q> {
    async fn progress_made(&self) {
        // A lost heartbeat only risks a duplicate delivery, which inserts ignore.
        if let Err(e) = self.queue.heartbeat(&self.receipt, self.visibility).await {
            tracing::warn!(receipt = %self.receipt, error = %e, "heartbeat failed");
        }
    }
}

#[derive(Debug)]
struct Entry {
    message_id: String,
    body: String,
    visible_at: Instant,
    receipt: Option<String>,
    receive_count: u32,
}

/// In-memory queue for tests and local runs.
///
/// Time is measured with [`tokio::time::Instant`], so paused-clock tests can
/// drive visibility expiry.
#[derive(Debug, Clone, Default)]
pub struct InMemoryQueue {
    state: Arc<Mutex<QueueState>>,
}

#[derive(Debug, Default)]
struct QueueState {
    next_seq: u64,
    // Keyed by send sequence, giving FIFO receive order.
    entries: BTreeMap<u64, Entry>,
}

impl InMemoryQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages not yet deleted, visible or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.entries.len())
    }

    /// Whether every message has been deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.entries.is_empty())
    }

    /// Bodies of all undeleted messages in send order.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue lock is poisoned.
    pub fn bodies(&self) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .entries
            .values()
            .map(|e| e.body.clone())
            .collect())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|_| Error::queue("queue lock poisoned"))
    }

    fn with_receipt<T>(
        &self,
        receipt: &str,
        f: impl FnOnce(&mut BTreeMap<u64, Entry>, u64) -> T,
    ) -> Result<T> {
        let mut state = self.lock()?;
        let seq = state
            .entries
            .iter()
            .find(|(_, e)| e.receipt.as_deref() == Some(receipt))
            .map(|(seq, _)| *seq)
            .ok_or_else(|| Error::queue(format!("unknown or expired receipt: {receipt}")))?;
        Ok(f(&mut state.entries, seq))
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn send(&self, body: String) -> Result<String> {
        let id = Ulid::new().to_string();
        let mut state = self.lock()?;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            seq,
            Entry {
                message_id: id.clone(),
                body,
                visible_at: Instant::now(),
                receipt: None,
                receive_count: 0,
            },
        );
        Ok(id)
    }

    async fn receive(&self, max: usize, visibility: Duration) -> Result<Vec<QueueMessage>> {
        let now = Instant::now();
        let mut state = self.lock()?;
        let mut out = Vec::new();
        for entry in state.entries.values_mut() {
            if out.len() >= max {
                break;
            }
            if entry.visible_at > now {
                continue;
            }
            let receipt = Ulid::new().to_string();
            entry.receipt = Some(receipt.clone());
            entry.visible_at = now + visibility;
            entry.receive_count += 1;
            out.push(QueueMessage {
                message_id: entry.message_id.clone(),
                receipt,
                body: entry.body.clone(),
                receive_count: entry.receive_count,
            });
        }
        Ok(out)
    }

    async fn heartbeat(&self, receipt: &str, visibility: Duration) -> Result<()> {
        let now = Instant::now();
        self.with_receipt(receipt, |entries, seq| {
            if let Some(entry) = entries.get_mut(&seq) {
                entry.visible_at = now + visibility;
            }
        })
    }

    async fn delete(&self, receipt: &str) -> Result<()> {
        self.with_receipt(receipt, |entries, seq| {
            entries.remove(&seq);
        })
    }

    async fn release(&self, receipt: &str, delay: Duration) -> Result<()> {
        let now = Instant::now();
        self.with_receipt(receipt, |entries, seq| {
            if let Some(entry) = entries.get_mut(&seq) {
                entry.receipt = None;
                entry.visible_at = now + delay;
            }
        })
    }
}

#[async_trait]
impl MessageQueue for MySqlQueue {
    async fn send(&self, body: String) -> Result<String> {
        Ok(MySqlQueue::send(self, &body).await?)
    }

    async fn receive(&self, max: usize, visibility: Duration) -> Result<Vec<QueueMessage>> {
        let deliveries = MySqlQueue::receive(self, max, visibility).await?;
        Ok(deliveries
            .into_iter()
            .map(|d| QueueMessage {
                message_id: d.message_id,
                receipt: d.receipt,
                body: d.body,
                receive_count: d.receive_count,
            })
            .collect())
    }

    async fn heartbeat(&self, receipt: &str, visibility: Duration) -> Result<()> {
        Ok(MySqlQueue::heartbeat(self, receipt, visibility).await?)
    }

    async fn delete(&self, receipt: &str) -> Result<()> {
        Ok(MySqlQueue::delete(self, receipt).await?)
    }

    async fn release(&self, receipt: &str, delay: Duration) -> Result<()> {
        Ok(MySqlQueue::release(self, receipt, delay).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VISIBILITY: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn received_message_is_hidden_until_timeout() {
        let queue = InMemoryQueue::new();
        queue.send("m1".into()).await.unwrap();

        let first = queue.receive(10, VISIBILITY).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].receive_count, 1);
        assert!(queue.receive(10, VISIBILITY).await.unwrap().is_empty());

        tokio::time::advance(VISIBILITY + Duration::from_secs(1)).await;
        let again = queue.receive(10, VISIBILITY).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].message_id, first[0].message_id);
        assert_eq!(again[0].receive_count, 2);
        assert_ne!(again[0].receipt, first[0].receipt);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_receipt_cannot_delete() {
        let queue = InMemoryQueue::new();
        queue.send("m1".into()).await.unwrap();
        let first = queue.receive(1, VISIBILITY).await.unwrap();
        tokio::time::advance(VISIBILITY * 2).await;
        let second = queue.receive(1, VISIBILITY).await.unwrap();

        assert!(queue.delete(&first[0].receipt).await.is_err());
        queue.delete(&second[0].receipt).await.unwrap();
        assert!(queue.is_empty().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_extends_visibility() {
        let queue = InMemoryQueue::new();
        queue.send("m1".into()).await.unwrap();
        let msg = queue.receive(1, VISIBILITY).await.unwrap().remove(0);

        tokio::time::advance(Duration::from_secs(50)).await;
        queue.heartbeat(&msg.receipt, VISIBILITY).await.unwrap();
        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(queue.receive(1, VISIBILITY).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn release_redelivers_after_delay() {
        let queue = InMemoryQueue::new();
        queue.send("m1".into()).await.unwrap();
        let msg = queue.receive(1, VISIBILITY).await.unwrap().remove(0);

        queue
            .release(&msg.receipt, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(queue.receive(1, VISIBILITY).await.unwrap().is_empty());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(queue.receive(1, VISIBILITY).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn receive_respects_max_and_order() {
        let queue = InMemoryQueue::new();
        for i in 0..5 {
            queue.send(format!("m{i}")).await.unwrap();
        }
        let batch = queue.receive(3, VISIBILITY).await.unwrap();
        let bodies: Vec<_> = batch.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["m0", "m1", "m2"]);
    }

    #[tokio::test]
    async fn heartbeat_reporter_swallows_errors() {
        let queue = Arc::new(InMemoryQueue::new());
        let reporter = QueueHeartbeat::new(Arc::clone(&queue), "missing", VISIBILITY);
        reporter.progress_made().await;
    }
}
