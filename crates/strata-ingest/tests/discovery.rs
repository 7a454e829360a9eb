//! Notification and scan producers converging on one discovery state.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;
use strata_core::{
    CountingSemaphore, MemoryObjectStore, ObjectStore, ObjectStoreSemaphore, WritePrecondition,
};
use strata_ingest::{
    AddSummary, BUCKET_SCANNER_WORKER, BucketScanner, FileManager, InMemoryQueue, MessageQueue,
    NotificationConsumer, PollSummary, ScanOutcome, ScannerConfig, SnapshotKind, SnapshotRoute,
    SubmissionMessage, WorkerPoolConfig,
};
use strata_store::{DiscoveryStateStore, FileState, FolderState, MemoryDatabase};

const BUCKET: &str = "prod.snapshot.record";
const TEAM_KEY: &str = "000000001/teamMemberSnapshots/2024-01-02/a.jsonl";
const OTHER_KEY: &str = "000000001/other/b.csv";
const LATE_KEY: &str = "000000001/teamMemberSnapshots/2024-01-03/c.jsonl";

struct Setup {
    db: Arc<MemoryDatabase>,
    queue: Arc<InMemoryQueue>,
    files: Arc<FileManager<MemoryDatabase>>,
}

fn setup() -> Setup {
    let db = Arc::new(MemoryDatabase::new());
    let queue = Arc::new(InMemoryQueue::new());
    let files = Arc::new(FileManager::new(
        DiscoveryStateStore::new(Arc::clone(&db)),
        vec![SnapshotRoute::for_kind(
            SnapshotKind::TeamMember,
            Arc::clone(&queue) as Arc<dyn MessageQueue>,
        )],
    ));
    Setup { db, queue, files }
}

fn event(keys: &[&str]) -> String {
    let records: Vec<_> = keys
        .iter()
        .map(|key| {
            json!({
                "eventTime": "2024-01-02T10:00:00.000Z",
                "s3": {
                    "bucket": {"name": BUCKET},
                    "object": {"key": key, "size": 100, "eTag": "abc"}
                }
            })
        })
        .collect();
    json!({ "Records": records }).to_string()
}

async fn store_with(keys: &[&str]) -> Arc<MemoryObjectStore> {
    let store = Arc::new(MemoryObjectStore::new());
    for key in keys {
        store
            .put(BUCKET, key, Bytes::from_static(b"{}\n"), WritePrecondition::None)
            .await
            .unwrap();
    }
    store
}

fn lock() -> Arc<ObjectStoreSemaphore<MemoryObjectStore>> {
    Arc::new(ObjectStoreSemaphore::new(
        Arc::new(MemoryObjectStore::new()),
        "coordination",
        "semaphores/",
    ))
}

#[tokio::test]
async fn notification_tracks_objects_and_routes_snapshots() {
    let s = setup();

    let summary = s
        .files
        .handle_notification(&event(&[TEAM_KEY, OTHER_KEY]))
        .await
        .expect("notification");
    assert_eq!(
        summary,
        AddSummary {
            seen: 2,
            new: 2,
            submitted: 1
        }
    );

    let record = s
        .files
        .discovery()
        .get_or_create(BUCKET, TEAM_KEY)
        .await
        .unwrap();
    assert_eq!(record.state, FileState::Unknown);

    let bodies = s.queue.bodies().unwrap();
    assert_eq!(bodies.len(), 1);
    assert_eq!(
        SubmissionMessage::decode(&bodies[0]).unwrap(),
        SubmissionMessage::new(BUCKET, TEAM_KEY)
    );

    let folders: Vec<_> = s
        .db
        .folders()
        .unwrap()
        .into_iter()
        .map(|f| (f.path, f.state))
        .collect();
    assert_eq!(
        folders,
        vec![
            ("000000001/other/".to_string(), FolderState::Rolling),
            (
                "000000001/teamMemberSnapshots/2024-01-02/".to_string(),
                FolderState::Rolling
            ),
        ]
    );
}

#[tokio::test]
async fn repeated_notification_is_a_no_op() {
    let s = setup();
    let body = event(&[TEAM_KEY]);
    s.files.handle_notification(&body).await.unwrap();
    let second = s.files.handle_notification(&body).await.unwrap();
    assert_eq!(second.new, 0);
    assert_eq!(second.submitted, 0);
    assert_eq!(s.queue.len().unwrap(), 1);
}

#[tokio::test]
async fn scan_picks_up_only_missed_objects() {
    let s = setup();
    s.files
        .handle_notification(&event(&[TEAM_KEY, OTHER_KEY]))
        .await
        .unwrap();

    let storage = store_with(&[TEAM_KEY, OTHER_KEY, LATE_KEY]).await;
    let scanner = BucketScanner::new(
        storage,
        Arc::clone(&s.files),
        lock(),
        ScannerConfig {
            buckets: vec![BUCKET.to_string()],
            ..ScannerConfig::default()
        },
    );

    let outcome = scanner.scan().await.expect("scan");
    assert_eq!(
        outcome,
        ScanOutcome::Completed(AddSummary {
            seen: 3,
            new: 1,
            submitted: 1
        })
    );
    assert_eq!(s.queue.len().unwrap(), 2);

    let mut rolling = s
        .files
        .discovery()
        .list_by_state(BUCKET, FolderState::Rolling)
        .unwrap();
    let mut paths = Vec::new();
    while let Some(folder) = rolling.next().await.unwrap() {
        paths.push(folder.path);
    }
    assert_eq!(paths.len(), 3);
}

#[tokio::test]
async fn scan_skips_while_slot_is_held() {
    let s = setup();
    let semaphore = lock();
    let held = semaphore
        .try_acquire(BUCKET_SCANNER_WORKER, Duration::from_secs(60), 1)
        .await
        .unwrap()
        .unwrap();

    let scanner = BucketScanner::new(
        store_with(&[TEAM_KEY]).await,
        Arc::clone(&s.files),
        Arc::clone(&semaphore),
        ScannerConfig {
            buckets: vec![BUCKET.to_string()],
            ..ScannerConfig::default()
        },
    );
    assert_eq!(scanner.scan().await.unwrap(), ScanOutcome::Skipped);
    assert!(s.queue.is_empty().unwrap());

    semaphore.release(&held).await.unwrap();
    assert!(matches!(
        scanner.scan().await.unwrap(),
        ScanOutcome::Completed(_)
    ));
}

#[tokio::test]
async fn malformed_notification_is_rejected() {
    let s = setup();
    assert!(s.files.handle_notification("not json").await.is_err());
    assert!(s.db.folders().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn consumer_drains_notifications_into_discovery() {
    let s = setup();
    let notifications = Arc::new(InMemoryQueue::new());
    notifications.send(event(&[TEAM_KEY])).await.unwrap();
    notifications.send("not json".into()).await.unwrap();
    notifications.send(event(&[OTHER_KEY])).await.unwrap();

    let consumer = NotificationConsumer::new(
        Arc::clone(&notifications),
        Arc::clone(&s.files),
        WorkerPoolConfig::default(),
    );
    let summary = consumer.poll_once().await.expect("poll");
    assert_eq!(
        summary,
        PollSummary {
            received: 3,
            accepted: 2,
            deferred: 0,
            failed: 1
        }
    );

    // The malformed notification is deleted with the handled ones.
    assert!(notifications.is_empty().unwrap());
    assert_eq!(s.queue.len().unwrap(), 1);
    assert_eq!(s.db.folders().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn consumer_leaves_failed_notifications_for_redelivery() {
    let db = Arc::new(MemoryDatabase::new());
    let broken = Arc::new(BrokenQueue);
    let files = Arc::new(FileManager::new(
        DiscoveryStateStore::new(Arc::clone(&db)),
        vec![SnapshotRoute::for_kind(
            SnapshotKind::TeamMember,
            broken as Arc<dyn MessageQueue>,
        )],
    ));
    let notifications = Arc::new(InMemoryQueue::new());
    notifications.send(event(&[TEAM_KEY])).await.unwrap();

    let config = WorkerPoolConfig::default();
    let consumer = NotificationConsumer::new(Arc::clone(&notifications), files, config.clone());
    let summary = consumer.poll_once().await.expect("poll");
    assert_eq!(summary.failed, 1);
    assert_eq!(notifications.len().unwrap(), 1);
    assert!(!is_tracked(&db, TEAM_KEY).await);

    tokio::time::advance(config.visibility_timeout + Duration::from_secs(1)).await;
    let again = notifications.receive(1, config.visibility_timeout).await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].receive_count, 2);
}

async fn is_tracked(db: &Arc<MemoryDatabase>, key: &str) -> bool {
    DiscoveryStateStore::new(Arc::clone(db))
        .exists(BUCKET, key)
        .await
        .unwrap()
}

struct BrokenQueue;

#[async_trait::async_trait]
impl MessageQueue for BrokenQueue {
    async fn send(&self, _body: String) -> strata_ingest::Result<String> {
        Err(strata_ingest::Error::queue("queue unavailable"))
    }

    async fn receive(
        &self,
        _max: usize,
        _visibility: Duration,
    ) -> strata_ingest::Result<Vec<strata_ingest::QueueMessage>> {
        Ok(Vec::new())
    }

    async fn heartbeat(&self, _receipt: &str, _visibility: Duration) -> strata_ingest::Result<()> {
        Ok(())
    }

    async fn delete(&self, _receipt: &str) -> strata_ingest::Result<()> {
        Ok(())
    }

    async fn release(&self, _receipt: &str, _delay: Duration) -> strata_ingest::Result<()> {
        Ok(())
    }
}

#[test]
fn every_kind_routes_on_its_own_segment() {
    let queue: Arc<dyn MessageQueue> = Arc::new(InMemoryQueue::new());
    let routes: Vec<_> = SnapshotKind::ALL
        .into_iter()
        .map(|kind| SnapshotRoute::for_kind(kind, Arc::clone(&queue)))
        .collect();
    let key = |segment: &str| format!("000000001/{segment}/2024-01-02/a.jsonl");
    for route in &routes {
        let matching: Vec<_> = routes
            .iter()
            .filter(|r| r.matches(&key(route.kind.key_segment())))
            .map(|r| r.kind)
            .collect();
        assert_eq!(matching, vec![route.kind]);
    }
}
