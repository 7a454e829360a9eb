//! Worker pool draining a message queue through a [`MessageHandler`].

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use crate::error::Result;
use crate::pipeline::{IngestOutcome, MessageDisposition, MessageHandler};
use crate::queue::{MessageQueue, QueueHeartbeat};

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Messages received (and processed concurrently) per poll.
    pub max_messages: usize,
    /// Invisibility granted on receive and on each heartbeat.
    pub visibility_timeout: Duration,
    /// Delay before a deferred message becomes visible again.
    pub retry_delay: Duration,
    /// Sleep between polls that found nothing.
    pub idle_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_messages: 10,
            visibility_timeout: Duration::from_secs(60),
            retry_delay: Duration::from_secs(60),
            idle_interval: Duration::from_secs(1),
        }
    }
}

/// Counts from one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Messages received.
    pub received: usize,
    /// Messages accepted and deleted.
    pub accepted: usize,
    /// Messages left for redelivery.
    pub deferred: usize,
    /// Messages that failed or whose task panicked. Permanent failures are
    /// deleted; the rest stay on the queue until their delivery lapses.
    pub failed: usize,
}

/// Receives messages and processes each on its own task.
pub struct IngestWorker<Q: MessageQueue + ?Sized, H: MessageHandler + ?Sized> {
    queue: Arc<Q>,
    handler: Arc<H>,
    config: WorkerPoolConfig,
}

impl<Q: MessageQueue + ?Sized, H: MessageHandler + ?Sized> IngestWorker<Q, H> {
    /// Creates a worker.
    #[must_use]
    pub fn new(queue: Arc<Q>, handler: Arc<H>, config: WorkerPoolConfig) -> Self {
        Self {
            queue,
            handler,
            config,
        }
    }

    /// Receives one round of messages and waits until all are handled.
    ///
    /// # Errors
    ///
    /// Returns an error if the receive itself fails. Per-message failures are
    /// counted, not returned.
    pub async fn poll_once(&self) -> Result<PollSummary> {
        let messages = self
            .queue
            .receive(self.config.max_messages, self.config.visibility_timeout)
            .await?;
        let mut summary = PollSummary {
            received: messages.len(),
            ..PollSummary::default()
        };

        let mut tasks = JoinSet::new();
        for message in messages {
            let queue = Arc::clone(&self.queue);
            let handler = Arc::clone(&self.handler);
            let visibility = self.config.visibility_timeout;
            let retry_delay = self.config.retry_delay;
            tasks.spawn(async move {
                let heartbeat = QueueHeartbeat::new(Arc::clone(&queue), &message.receipt, visibility);
                let outcome = handler.handle(&message, &heartbeat).await;
                let applied = match outcome.disposition() {
                    MessageDisposition::Delete => queue.delete(&message.receipt).await,
                    MessageDisposition::Release => {
                        queue.release(&message.receipt, retry_delay).await
                    }
                    MessageDisposition::Abandon => Ok(()),
                };
                if let Err(e) = applied {
                    // The delivery lapses on its own and the message is redelivered.
                    tracing::warn!(message_id = %message.message_id, error = %e, "failed to apply message disposition");
                }
                outcome
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(IngestOutcome::Accepted { .. }) => summary.accepted += 1,
                Ok(IngestOutcome::Deferred { .. }) => summary.deferred += 1,
                Ok(IngestOutcome::Failed(_)) => summary.failed += 1,
                Err(e) => {
                    tracing::error!(error = %e, "message task panicked");
                    summary.failed += 1;
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
                        accepted = summary.accepted,
                        deferred = summary.deferred,
                        failed = summary.failed,
                        "poll completed"
                    );
                }
                Ok(_) => tokio::time::sleep(self.config.idle_interval).await,
                Err(e) => {
                    tracing::error!(error = %e, "failed to receive messages");
                    tokio::time::sleep(self.config.idle_interval).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{InMemoryQueue, ProgressReporter, QueueMessage};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for ScriptedHandler {
        async fn handle(
            &self,
            message: &QueueMessage,
            progress: &dyn ProgressReporter,
        ) -> IngestOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            progress.progress_made().await;
            match message.body.as_str() {
                "ok" => IngestOutcome::Accepted { rows: 1 },
                "later" => IngestOutcome::Deferred {
                    table: "T".into(),
                    partition: "p20240101".into(),
                },
                "flaky" => IngestOutcome::Failed(crate::error::Error::queue("timed out")),
                _ => IngestOutcome::Failed(crate::error::Error::malformed("bad")),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dispositions_are_applied() {
        let queue = Arc::new(InMemoryQueue::new());
        for body in ["ok", "later", "bad"] {
            queue.send(body.into()).await.unwrap();
        }
        let handler = Arc::new(ScriptedHandler {
            calls: AtomicUsize::new(0),
        });
        let config = WorkerPoolConfig {
            retry_delay: Duration::from_secs(5),
            ..WorkerPoolConfig::default()
        };
        let worker = IngestWorker::new(Arc::clone(&queue), Arc::clone(&handler), config);

        let summary = worker.poll_once().await.unwrap();
        assert_eq!(
            summary,
            PollSummary {
                received: 3,
                accepted: 1,
                deferred: 1,
                failed: 1
            }
        );
        assert_eq!(queue.bodies().unwrap(), vec!["later".to_string()]);

        assert_eq!(worker.poll_once().await.unwrap().received, 0);
        tokio::time::advance(Duration::from_secs(6)).await;
        let retry = worker.poll_once().await.unwrap();
        assert_eq!(retry.deferred, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_lapse_back_onto_the_queue() {
        let queue = Arc::new(InMemoryQueue::new());
        queue.send("flaky".into()).await.unwrap();
        let handler = Arc::new(ScriptedHandler {
            calls: AtomicUsize::new(0),
        });
        let worker = IngestWorker::new(
            Arc::clone(&queue),
            Arc::clone(&handler),
            WorkerPoolConfig::default(),
        );

        assert_eq!(worker.poll_once().await.unwrap().failed, 1);
        assert_eq!(queue.len().unwrap(), 1);
        assert_eq!(worker.poll_once().await.unwrap().received, 0);

        tokio::time::advance(Duration::from_secs(61)).await;
        let messages = queue.receive(10, Duration::from_secs(60)).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].receive_count, 2);
    }
}
