//! # strata-worker
//!
//! Worker service for Strata warehouse ingestion.
//!
//! Ingests snapshot artifacts into the partitioned warehouse tables, keeps
//! those tables provisioned ahead of ingestion and exposes the discovery state
//! for operators.
//!
//! ## Modes
//!
//! - **Service Mode**: Runs one ingestion worker per snapshot kind, the
//!   notification consumer, the bucket scanner and the partition maintenance
//!   loop, with HTTP health and metrics endpoints
//! - **CLI Mode**: One maintenance pass, or a listing of tracked folders
//!
//! ## Endpoints
//!
//! - `GET /health` - Shallow liveness check (always 200)
//! - `GET /ready` - Database reachable and last maintenance tick not failed
//! - `GET /metrics` - Prometheus exposition
//!
//! ## Usage
//!
//! ```bash
//! # Run as service (default port 8090)
//! strata-worker serve
//!
//! # One maintenance pass
//! strata-worker maintain
//!
//! # Folders still rolling in a bucket
//! strata-worker list-folders --bucket prod.snapshot.record --state rolling
//! ```

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

mod config;
mod metrics;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;

use strata_core::{LocalFsObjectStore, init_logging};
use strata_ingest::{
    BucketScanner, FileManager, IngestWorker, IngestionPipeline, MaintenanceOutcome, ManagedTable,
    NotificationConsumer, PartitionMaintenanceJob, ScannerConfig, SnapshotKind, SnapshotRoute,
};
use strata_store::{
    CatalogCacheConfig, DiscoveryStateStore, FolderState, MySqlDatabase, MySqlQueue,
    MySqlSemaphore, PartitionManager, PartitionManagerConfig,
};

use crate::config::WorkerConfig;

type MaintenanceJob = PartitionMaintenanceJob<MySqlDatabase, MySqlSemaphore>;

// ============================================================================
// CLI Arguments
// ============================================================================

/// Strata ingestion worker.
#[derive(Debug, Parser)]
#[command(name = "strata-worker")]
#[command(about = "Snapshot ingestion, partition maintenance and discovery administration for Strata")]
#[command(version)]
struct Args {
    /// MySQL URL; overrides `STRATA_DATABASE_URL`.
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run as a service: ingestion, discovery, maintenance and HTTP endpoints.
    Serve {
        /// HTTP port; overrides `STRATA_HTTP_PORT`.
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run a single partition maintenance pass.
    Maintain,

    /// List tracked folders of a bucket in one state.
    ListFolders {
        /// Bucket to list.
        #[arg(long)]
        bucket: String,

        /// Folder state (`rolling` or `collated`).
        #[arg(long, default_value = "rolling")]
        state: String,
    },
}

// ============================================================================
// Health State
// ============================================================================

/// Outcome counters of the maintenance loop.
#[derive(Debug, Default)]
struct WorkerState {
    /// Whether startup finished.
    ready: AtomicBool,
    /// Whether the latest maintenance tick failed.
    last_tick_failed: AtomicBool,
    /// Unix timestamp of the latest tick that did not fail.
    last_ok_tick_ts: AtomicU64,
    completed_ticks: AtomicU64,
    skipped_ticks: AtomicU64,
    failed_ticks: AtomicU64,
}

impl WorkerState {
    fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    fn record_tick(&self, result: &strata_ingest::Result<MaintenanceOutcome>) {
        match result {
            Ok(outcome) => {
                let now: u64 = Utc::now().timestamp().try_into().unwrap_or_default();
                self.last_ok_tick_ts.store(now, Ordering::Release);
                self.last_tick_failed.store(false, Ordering::Release);
                if outcome.is_skipped() {
                    self.skipped_ticks.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.completed_ticks.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(_) => {
                self.last_tick_failed.store(true, Ordering::Release);
                self.failed_ticks.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn last_ok_tick(&self) -> Option<DateTime<Utc>> {
        let ts = self.last_ok_tick_ts.load(Ordering::Acquire);
        if ts == 0 {
            return None;
        }
        DateTime::from_timestamp(i64::try_from(ts).ok()?, 0)
    }
}

#[derive(Clone)]
struct ServiceState {
    worker: Arc<WorkerState>,
    database: MySqlDatabase,
}

// ============================================================================
// HTTP Endpoints
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Debug, Serialize)]
struct ReadyResponse {
    ready: bool,
    database: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_ok_maintenance: Option<String>,
    completed_ticks: u64,
    skipped_ticks: u64,
    failed_ticks: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

/// GET /health - Shallow liveness check.
async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// GET /ready - Database reachable and maintenance not failing.
async fn ready(State(state): State<Arc<ServiceState>>) -> impl IntoResponse {
    let ready = state.worker.ready.load(Ordering::Acquire);
    let last_failed = state.worker.last_tick_failed.load(Ordering::Acquire);
    let database = match state.database.health_check().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "readiness database check failed");
            false
        }
    };

    let message = if !ready {
        Some("Service starting up".to_string())
    } else if !database {
        Some("Database unreachable".to_string())
    } else if last_failed {
        Some("Last partition maintenance tick failed".to_string())
    } else {
        None
    };

    let status = if message.is_none() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyResponse {
            ready,
            database,
            last_ok_maintenance: state.worker.last_ok_tick().map(|dt| dt.to_rfc3339()),
            completed_ticks: state.worker.completed_ticks.load(Ordering::Relaxed),
            skipped_ticks: state.worker.skipped_ticks.load(Ordering::Relaxed),
            failed_ticks: state.worker.failed_ticks.load(Ordering::Relaxed),
            message,
        }),
    )
}

// ============================================================================
// Wiring
// ============================================================================

async fn connect(config: &WorkerConfig) -> Result<MySqlDatabase> {
    let url = config.require_database_url()?;
    MySqlDatabase::connect(url, config.database_max_connections)
        .await
        .context("failed to connect to the warehouse database")
}

fn partition_manager(
    config: &WorkerConfig,
    database: &MySqlDatabase,
) -> Arc<PartitionManager<MySqlDatabase>> {
    Arc::new(PartitionManager::new(
        Arc::new(database.clone()),
        PartitionManagerConfig {
            initial_window: config.partition_window(Utc::now()),
            cache: CatalogCacheConfig::default(),
        },
    ))
}

fn maintenance_job(
    config: &WorkerConfig,
    database: &MySqlDatabase,
    partitions: Arc<PartitionManager<MySqlDatabase>>,
) -> MaintenanceJob {
    let semaphore = Arc::new(MySqlSemaphore::new(database));
    let tables = SnapshotKind::ALL.into_iter().map(ManagedTable::from).collect();
    PartitionMaintenanceJob::new(partitions, semaphore, tables, config.maintenance())
}

/// Spawns one ingestion worker per kind, the notification consumer and, when
/// buckets are configured, the bucket scanner.
fn spawn_ingestion(
    config: &WorkerConfig,
    database: &MySqlDatabase,
    partitions: &Arc<PartitionManager<MySqlDatabase>>,
) -> Result<()> {
    let root = config.require_storage_root()?;
    let storage = Arc::new(LocalFsObjectStore::new(root));
    let sink = Arc::new(database.clone());

    let mut routes = Vec::with_capacity(SnapshotKind::ALL.len());
    for kind in SnapshotKind::ALL {
        let queue = Arc::new(MySqlQueue::new(database, kind.as_str()));
        let pipeline = IngestionPipeline::new(
            kind,
            Arc::clone(&storage),
            Arc::clone(partitions),
            Arc::clone(&sink),
            config.pipeline(),
        )?;
        let worker = IngestWorker::new(
            Arc::clone(&queue),
            Arc::new(pipeline),
            config.worker_pool.clone(),
        );
        tokio::spawn(async move { worker.run().await });
        routes.push(SnapshotRoute::for_kind(kind, queue));
    }

    let files = Arc::new(FileManager::new(
        DiscoveryStateStore::new(Arc::new(database.clone())),
        routes,
    ));
    let notifications = NotificationConsumer::new(
        Arc::new(MySqlQueue::new(database, config.notification_queue.as_str())),
        Arc::clone(&files),
        config.worker_pool.clone(),
    );
    tokio::spawn(async move { notifications.run().await });

    if config.scan_buckets.is_empty() {
        tracing::info!("no scan buckets configured; bucket scanner disabled");
    } else {
        let scanner = BucketScanner::new(
            storage,
            files,
            Arc::new(MySqlSemaphore::new(database)),
            ScannerConfig {
                buckets: config.scan_buckets.clone(),
                lock_timeout: config.lock_timeout,
            },
        );
        let interval = config.scan_interval;
        tokio::spawn(async move { scanner.run_loop(interval).await });
    }

    tracing::info!(
        storage_root = %root.display(),
        kinds = SnapshotKind::ALL.len(),
        scan_buckets = config.scan_buckets.len(),
        "ingestion started"
    );
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = WorkerConfig::from_env()?;
    if let Some(url) = args.database_url {
        config.database_url = Some(url);
    }

    init_logging(config.log_format);

    match args.command {
        Commands::Serve { port } => {
            let port = port.unwrap_or(config.http_port);
            metrics::init_metrics().context("failed to install the metrics recorder")?;

            tracing::info!(
                port,
                interval_secs = config.maintenance_interval.as_secs(),
                horizon_days = config.maintenance_horizon_days,
                "starting strata worker"
            );

            let database = connect(&config).await?;
            let partitions = partition_manager(&config, &database);
            spawn_ingestion(&config, &database, &partitions)?;
            let job = Arc::new(maintenance_job(&config, &database, partitions));
            let worker = Arc::new(WorkerState::default());
            let state = Arc::new(ServiceState {
                worker: Arc::clone(&worker),
                database,
            });

            let loop_state = Arc::clone(&worker);
            tokio::spawn(async move {
                job.run_loop(|result| loop_state.record_tick(result)).await;
            });

            let router = Router::new()
                .route("/health", get(health))
                .route("/ready", get(ready))
                .route("/metrics", get(metrics::serve_metrics))
                .with_state(state);

            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            tracing::info!(address = %addr, "starting http server");

            let listener = tokio::net::TcpListener::bind(addr).await?;
            worker.mark_ready();
            axum::serve(listener, router).await?;
        }

        Commands::Maintain => {
            let database = connect(&config).await?;
            let job = maintenance_job(&config, &database, partition_manager(&config, &database));
            match job.run_once(Utc::now()).await? {
                MaintenanceOutcome::Skipped => {
                    tracing::info!("another worker holds the maintenance slot; nothing done");
                }
                MaintenanceOutcome::Completed {
                    tables,
                    partitions_created,
                } => {
                    tracing::info!(tables, partitions_created, "maintenance pass complete");
                }
            }
        }

        Commands::ListFolders { bucket, state } => {
            let state: FolderState = state.parse()?;
            let database = connect(&config).await?;
            let discovery = DiscoveryStateStore::new(Arc::new(database));
            let mut folders = discovery.list_by_state(&bucket, state)?;
            let mut count = 0usize;
            while let Some(folder) = folders.next().await? {
                println!("{}\t{}", folder.path, folder.updated_on.to_rfc3339());
                count += 1;
            }
            tracing::info!(bucket = %bucket, state = %state, count, "folders listed");
        }
    }

    Ok(())
}
