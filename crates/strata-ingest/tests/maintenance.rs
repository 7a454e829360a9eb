//! Partition maintenance gated by the counting semaphore.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use strata_core::partition::Period;
use strata_core::{CountingSemaphore, MemoryObjectStore, ObjectStoreSemaphore};
use strata_ingest::{
    Error, MaintenanceConfig, MaintenanceOutcome, ManagedTable, PartitionMaintenanceJob,
    SnapshotKind, TABLE_PARTITION_WORKER,
};
use strata_store::schema::CatalogPartition;
use strata_store::{
    CatalogCacheConfig, DdlStatement, MemoryDatabase, PartitionManager, PartitionManagerConfig,
    PartitionWindow, SchemaBackend,
};

type Semaphore = ObjectStoreSemaphore<MemoryObjectStore>;

fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

fn manager<B: SchemaBackend>(backend: Arc<B>) -> Arc<PartitionManager<B>> {
    Arc::new(PartitionManager::new(
        backend,
        PartitionManagerConfig {
            initial_window: PartitionWindow {
                start: utc(2024, 1, 1),
                end: utc(2024, 1, 4),
            },
            cache: CatalogCacheConfig::default(),
        },
    ))
}

fn semaphore() -> Arc<Semaphore> {
    Arc::new(ObjectStoreSemaphore::new(
        Arc::new(MemoryObjectStore::new()),
        "coordination",
        "semaphores/",
    ))
}

fn all_tables() -> Vec<ManagedTable> {
    SnapshotKind::ALL.into_iter().map(ManagedTable::from).collect()
}

struct BrokenSchema;

#[async_trait]
impl SchemaBackend for BrokenSchema {
    async fn execute_ddl(&self, _statement: &DdlStatement) -> strata_store::Result<()> {
        Err(strata_store::Error::database("lost connection"))
    }

    async fn table_exists(&self, _table: &str) -> strata_store::Result<bool> {
        Ok(false)
    }

    async fn list_partitions(&self, _table: &str) -> strata_store::Result<Vec<CatalogPartition>> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn creates_tables_and_extends_through_horizon() {
    let db = Arc::new(MemoryDatabase::new());
    let partitions = manager(Arc::clone(&db));
    let job = PartitionMaintenanceJob::new(
        Arc::clone(&partitions),
        semaphore(),
        all_tables(),
        MaintenanceConfig::default(),
    );

    let outcome = job.run_once(utc(2024, 1, 2)).await.expect("maintenance");
    // WEEK gains p20240108, DAY gains Jan 4 through Jan 9, MONTH already covers Jan 9.
    assert_eq!(
        outcome,
        MaintenanceOutcome::Completed {
            tables: 3,
            partitions_created: 7
        }
    );

    let daily = partitions
        .list_partitions("BULK_FILE_DOWNLOAD_RECORD", Period::Day)
        .await
        .expect("list");
    assert_eq!(daily.last().unwrap().partition_name, "p20240109");
    assert!(
        partitions
            .partition_exists_for("TEAM_MEMBER_SNAPSHOT", utc(2024, 1, 9), Period::Week)
            .await
            .expect("check")
    );

    let again = job.run_once(utc(2024, 1, 2)).await.expect("maintenance");
    assert_eq!(
        again,
        MaintenanceOutcome::Completed {
            tables: 3,
            partitions_created: 0
        }
    );
}

#[tokio::test]
async fn skips_while_another_worker_holds_the_slot() {
    let db = Arc::new(MemoryDatabase::new());
    let lock = semaphore();
    let job = PartitionMaintenanceJob::new(
        manager(Arc::clone(&db)),
        Arc::clone(&lock),
        all_tables(),
        MaintenanceConfig::default(),
    );

    let held = lock
        .try_acquire(TABLE_PARTITION_WORKER, Duration::from_secs(30), 1)
        .await
        .expect("acquire")
        .expect("slot");

    let outcome = job.run_once(utc(2024, 1, 2)).await.expect("maintenance");
    assert!(outcome.is_skipped());
    assert!(db.ddl_log().expect("log").is_empty());

    lock.release(&held).await.expect("release");
    let outcome = job.run_once(utc(2024, 1, 2)).await.expect("maintenance");
    assert!(!outcome.is_skipped());
}

#[tokio::test]
async fn failure_releases_the_slot() {
    let lock = semaphore();
    let job = PartitionMaintenanceJob::new(
        manager(Arc::new(BrokenSchema)),
        Arc::clone(&lock),
        all_tables(),
        MaintenanceConfig::default(),
    );

    assert!(job.run_once(utc(2024, 1, 2)).await.is_err());

    let lease = lock
        .try_acquire(TABLE_PARTITION_WORKER, Duration::from_secs(30), 1)
        .await
        .expect("acquire");
    assert!(lease.is_some());
}

#[tokio::test]
async fn out_of_range_horizon_fails_the_tick() {
    let lock = semaphore();
    let db = Arc::new(MemoryDatabase::new());
    let job = PartitionMaintenanceJob::new(
        manager(Arc::clone(&db)),
        Arc::clone(&lock),
        all_tables(),
        MaintenanceConfig {
            horizon: chrono::Duration::days(i64::from(u32::MAX)),
            ..MaintenanceConfig::default()
        },
    );

    let err = job.run_once(utc(2024, 1, 2)).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)), "{err}");
    assert!(!db.table_exists("TEAM_MEMBER_SNAPSHOT").await.expect("exists"));

    let lease = lock
        .try_acquire(TABLE_PARTITION_WORKER, Duration::from_secs(30), 1)
        .await
        .expect("acquire");
    assert!(lease.is_some());
}

#[tokio::test]
async fn custom_horizon_extends_further() {
    let db = Arc::new(MemoryDatabase::new());
    let partitions = manager(Arc::clone(&db));
    let job = PartitionMaintenanceJob::new(
        Arc::clone(&partitions),
        semaphore(),
        vec![ManagedTable::from(SnapshotKind::UserAccess)],
        MaintenanceConfig {
            horizon: chrono::Duration::days(60),
            ..MaintenanceConfig::default()
        },
    );

    job.run_once(utc(2024, 1, 2)).await.expect("maintenance");
    let monthly = partitions
        .list_partitions("USER_ACCESS_RECORD", Period::Month)
        .await
        .expect("list");
    let names: Vec<_> = monthly.iter().map(|p| p.partition_name.as_str()).collect();
    assert_eq!(names, vec!["p20240101", "p20240201", "p20240301"]);
}

#[tokio::test(start_paused = true)]
async fn loop_reports_every_tick() {
    let job = Arc::new(PartitionMaintenanceJob::new(
        manager(Arc::new(MemoryDatabase::new())),
        semaphore(),
        vec![ManagedTable::from(SnapshotKind::TeamMember)],
        MaintenanceConfig::default(),
    ));

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        job.run_loop(|result| {
            let _ = tx.send(result.as_ref().map(MaintenanceOutcome::is_skipped).ok());
        })
        .await;
    });

    assert_eq!(rx.recv().await, Some(Some(false)));
    assert_eq!(rx.recv().await, Some(Some(false)));
    handle.abort();
}
