//! Periodic partition maintenance.
//!
//! Every worker runs the maintenance loop, but each tick only proceeds on the
//! worker that takes the `TABLE_PARTITION_WORKER` semaphore slot. The winner
//! creates any missing partitioned table and extends every table's partitions
//! through `now + horizon`, so ingestion never has to wait on DDL. This job is
//! the only writer of partition DDL.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use strata_core::observability::maintenance_span;
use strata_core::partition::Period;
use strata_core::{CountingSemaphore, run_exclusive};
use strata_store::{PartitionManager, SchemaBackend, TableDefinition};
use tracing::Instrument;

use crate::error::{Error, Result};
use crate::metrics;
use crate::snapshot::SnapshotKind;

/// Semaphore key gating maintenance.
pub const TABLE_PARTITION_WORKER: &str = "TABLE_PARTITION_WORKER";

/// Maintenance settings.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Time between ticks.
    pub interval: Duration,
    /// Delay before the first tick.
    pub start_delay: Duration,
    /// How far ahead of now partitions must exist.
    pub horizon: chrono::Duration,
    /// Lease duration on the semaphore slot.
    pub lock_timeout: Duration,
    /// Concurrent holders allowed.
    pub max_holders: u32,
    /// Semaphore key.
    pub semaphore_key: String,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(4 * 60 * 60),
            start_delay: Duration::from_millis(1013),
            horizon: chrono::Duration::days(7),
            lock_timeout: Duration::from_secs(30),
            max_holders: 1,
            semaphore_key: TABLE_PARTITION_WORKER.to_string(),
        }
    }
}

/// A table kept provisioned by maintenance.
#[derive(Debug, Clone)]
pub struct ManagedTable {
    /// Table schema.
    pub definition: TableDefinition,
    /// Partition period.
    pub period: Period,
}

impl From<SnapshotKind> for ManagedTable {
    fn from(kind: SnapshotKind) -> Self {
        Self {
            definition: kind.definition(),
            period: kind.period(),
        }
    }
}

/// Result of one maintenance tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaintenanceOutcome {
    /// Another worker holds the slot; nothing was done.
    Skipped,
    /// This worker ran maintenance.
    Completed {
        /// Tables checked.
        tables: usize,
        /// Partitions added across all tables.
        partitions_created: usize,
    },
}

impl MaintenanceOutcome {
    /// Returns true for [`MaintenanceOutcome::Skipped`].
    #[must_use]
    pub const fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }
}

/// Keeps partitioned tables provisioned ahead of ingestion.
pub struct PartitionMaintenanceJob<B: SchemaBackend + ?Sized, L: CountingSemaphore + ?Sized> {
    partitions: Arc<PartitionManager<B>>,
    semaphore: Arc<L>,
    tables: Vec<ManagedTable>,
    config: MaintenanceConfig,
}

impl<B: SchemaBackend + ?Sized, L: CountingSemaphore + ?Sized> PartitionMaintenanceJob<B, L> {
    /// Creates a job over `tables`.
    #[must_use]
    pub fn new(
        partitions: Arc<PartitionManager<B>>,
        semaphore: Arc<L>,
        tables: Vec<ManagedTable>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            partitions,
            semaphore,
            tables,
            config,
        }
    }

    /// Runs one tick at `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the semaphore is unreachable or DDL fails. The slot
    /// is released in both cases.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<MaintenanceOutcome> {
        let ran = run_exclusive(
            self.semaphore.as_ref(),
            &self.config.semaphore_key,
            self.config.lock_timeout,
            self.config.max_holders,
            self.provision_all(now),
        )
        .await;

        let outcome = match ran {
            Ok(Some(Ok(created))) => MaintenanceOutcome::Completed {
                tables: self.tables.len(),
                partitions_created: created,
            },
            Ok(Some(Err(e))) => {
                metrics::record_maintenance("failed", 0);
                return Err(e);
            }
            Ok(None) => MaintenanceOutcome::Skipped,
            Err(e) => {
                metrics::record_maintenance("failed", 0);
                return Err(Error::Core(e));
            }
        };

        match &outcome {
            MaintenanceOutcome::Skipped => {
                tracing::debug!("partition maintenance skipped; slot held elsewhere");
                metrics::record_maintenance("skipped", 0);
            }
            MaintenanceOutcome::Completed {
                tables,
                partitions_created,
            } => {
                tracing::info!(tables, partitions_created, "partition maintenance completed");
                let created = u64::try_from(*partitions_created).unwrap_or(u64::MAX);
                metrics::record_maintenance("completed", created);
            }
        }
        Ok(outcome)
    }

    async fn provision_all(&self, now: DateTime<Utc>) -> Result<usize> {
        let until = now.checked_add_signed(self.config.horizon).ok_or_else(|| {
            Error::InvalidInput(format!(
                "maintenance horizon of {} days from {now} is out of range",
                self.config.horizon.num_days()
            ))
        })?;
        let mut created = 0;
        for table in &self.tables {
            created += self
                .provision(table, until)
                .instrument(maintenance_span(&table.definition.name))
                .await?;
        }
        Ok(created)
    }

    async fn provision(&self, table: &ManagedTable, until: DateTime<Utc>) -> Result<usize> {
        self.partitions
            .create_table(&table.definition, true, table.period)
            .await?;
        let created = self
            .partitions
            .extend_window(&table.definition.name, table.period, until)
            .await?;
        Ok(created.len())
    }

    /// Runs ticks forever: first after the start delay, then every interval.
    /// Failed ticks are logged and retried on the next tick. `on_tick` sees
    /// every tick's result.
    pub async fn run_loop<F>(&self, mut on_tick: F)
    where
        F: FnMut(&Result<MaintenanceOutcome>) + Send,
    {
        tokio::time::sleep(self.config.start_delay).await;
        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            ticker.tick().await;
            let result = self.run_once(Utc::now()).await;
            if let Err(e) = &result {
                tracing::error!(error = %e, "partition maintenance failed");
            }
            on_tick(&result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = MaintenanceConfig::default();
        assert_eq!(config.interval, Duration::from_secs(14_400));
        assert_eq!(config.start_delay, Duration::from_millis(1013));
        assert_eq!(config.horizon, chrono::Duration::days(7));
        assert_eq!(config.lock_timeout, Duration::from_secs(30));
        assert_eq!(config.max_holders, 1);
        assert_eq!(config.semaphore_key, "TABLE_PARTITION_WORKER");
    }

    #[test]
    fn managed_table_from_kind() {
        let table = ManagedTable::from(SnapshotKind::UserAccess);
        assert_eq!(table.definition.name, "USER_ACCESS_RECORD");
        assert_eq!(table.period, Period::Month);
    }
}
