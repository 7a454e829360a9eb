//! Partition provisioning and admission checks for range-partitioned tables.
//!
//! The manager is the only component that issues partition DDL. Writers ask it
//! whether the partition for a row's timestamp exists before inserting; a row
//! whose slice is not provisioned must not land in the catch-all.
//!
//! Catalog reads are cached per table. Partitions are never dropped, so a
//! positive answer stays valid; a negative answer is re-read once the cached
//! catalog is older than [`CatalogCacheConfig::staleness`]. The manager's own
//! DDL invalidates the table's entry immediately.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use strata_core::partition::{Boundary, PartitionDescriptor, Period, partition_for};
use strata_core::partition::{partition_name, partitions_between};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::schema::{CatalogPartition, DdlStatement, SchemaBackend};
use crate::table::TableDefinition;

/// Default staleness bound for negative catalog answers.
pub const DEFAULT_CATALOG_STALENESS: Duration = Duration::from_secs(30);

/// Catalog cache tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogCacheConfig {
    /// Age after which a cached catalog is re-read before answering "absent".
    pub staleness: Duration,
}

impl Default for CatalogCacheConfig {
    fn default() -> Self {
        Self {
            staleness: DEFAULT_CATALOG_STALENESS,
        }
    }
}

/// Time window provisioned when a partitioned table is first created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionWindow {
    /// Start of the window (its slice is included).
    pub start: DateTime<Utc>,
    /// Exclusive end of the window.
    pub end: DateTime<Utc>,
}

impl PartitionWindow {
    /// Window from the first of the current month through `now + horizon`.
    /// The end saturates at the latest representable instant.
    #[must_use]
    pub fn around(now: DateTime<Utc>, horizon: Duration) -> Self {
        let start = Period::Month.floor(now);
        let end = chrono::Duration::from_std(horizon)
            .ok()
            .and_then(|horizon| now.checked_add_signed(horizon))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self { start, end }
    }
}

impl Default for PartitionWindow {
    fn default() -> Self {
        Self::around(Utc::now(), Duration::from_secs(7 * 24 * 3600))
    }
}

/// Partition manager settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionManagerConfig {
    /// Window provisioned by [`PartitionManager::create_table`].
    pub initial_window: PartitionWindow,
    /// Catalog cache tuning.
    pub cache: CatalogCacheConfig,
}

#[derive(Debug, Clone)]
struct CachedCatalog {
    names: HashSet<String>,
    fetched_at: Instant,
}

impl CachedCatalog {
    fn is_fresh(&self, staleness: Duration) -> bool {
        self.fetched_at.elapsed() < staleness
    }
}

/// Creates partitioned tables, answers admission checks and extends windows.
pub struct PartitionManager<B: SchemaBackend + ?Sized> {
    backend: Arc<B>,
    config: PartitionManagerConfig,
    cache: RwLock<HashMap<String, CachedCatalog>>,
}

impl<B: SchemaBackend + ?Sized> PartitionManager<B> {
    /// Creates a manager over `backend`.
    #[must_use]
    pub fn new(backend: Arc<B>, config: PartitionManagerConfig) -> Self {
        Self {
            backend,
            config,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the manager's configuration.
    #[must_use]
    pub const fn config(&self) -> &PartitionManagerConfig {
        &self.config
    }

    /// Creates `definition` if it does not exist.
    ///
    /// Partitioned tables get one partition per `period` slice of the initial
    /// window plus the catch-all. The statement is conditional, so running it
    /// against an existing table changes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDefinition`] for inconsistent definitions and
    /// propagates DDL failures without retrying.
    pub async fn create_table(
        &self,
        definition: &TableDefinition,
        partitioned: bool,
        period: Period,
    ) -> Result<()> {
        definition.validate()?;

        let partitions = if partitioned {
            if definition.partition_column.is_none() {
                return Err(Error::InvalidDefinition {
                    message: format!("{}: partitioned table needs a partition column", definition.name),
                });
            }
            let window = self.config.initial_window;
            Some(partitions_between(&definition.name, window.start, window.end, period)?)
        } else {
            None
        };

        let statement = DdlStatement::CreateTable {
            definition: definition.clone(),
            partitions,
        };
        tracing::info!(table = %definition.name, partitioned, %period, "creating table if absent");
        let result = self.backend.execute_ddl(&statement).await;
        self.invalidate(&definition.name).await;
        result
    }

    /// Returns true if the partition covering `timestamp` is provisioned.
    ///
    /// A missing table or partition answers `false`, never an error.
    ///
    /// # Errors
    ///
    /// Propagates catalog read failures.
    pub async fn partition_exists_for(
        &self,
        table: &str,
        timestamp: DateTime<Utc>,
        period: Period,
    ) -> Result<bool> {
        let expected = partition_name(timestamp, period);
        let staleness = self.config.cache.staleness;

        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(table) {
                if cached.names.contains(&expected) {
                    return Ok(true);
                }
                if cached.is_fresh(staleness) {
                    return Ok(false);
                }
            }
        }

        let names = self.refresh(table).await?;
        Ok(names.contains(&expected))
    }

    /// Adds partitions after the last provisioned one until the slice
    /// containing `until` exists.
    ///
    /// Returns the created descriptors; empty when already provisioned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the table has no bounded partitions
    /// or its last bound is not aligned to `period`. DDL failures propagate.
    pub async fn extend_window(
        &self,
        table: &str,
        period: Period,
        until: DateTime<Utc>,
    ) -> Result<Vec<PartitionDescriptor>> {
        let existing = self.list_partitions(table, period).await?;
        let Some(last) = existing.last() else {
            return Err(Error::InvalidInput(format!(
                "{table} has no bounded partitions to extend"
            )));
        };

        let last_end = last.range_end;
        if period.floor(last_end) != last_end {
            return Err(Error::InvalidInput(format!(
                "{table}: last bound {last_end} is not aligned to {period}"
            )));
        }

        let target = partition_for(table, until, period).range_end;
        if last_end >= target {
            tracing::debug!(table, %until, "partitions already provisioned");
            return Ok(Vec::new());
        }

        let created = partitions_between(table, last_end, target, period)?;
        let statement = DdlStatement::ReorganizeCatchAll {
            table: table.to_string(),
            partitions: created.clone(),
        };
        tracing::info!(
            table,
            count = created.len(),
            first = %created.first().map_or("", |p| p.partition_name.as_str()),
            last = %created.last().map_or("", |p| p.partition_name.as_str()),
            "extending partition window"
        );
        let result = self.backend.execute_ddl(&statement).await;
        self.invalidate(table).await;
        result.map(|()| created)
    }

    /// Reads a table's bounded partitions back from the catalog.
    ///
    /// Ranges are rebuilt from consecutive bounds; the first partition starts at
    /// the slice preceding its bound.
    ///
    /// # Errors
    ///
    /// Propagates catalog read failures.
    pub async fn list_partitions(
        &self,
        table: &str,
        period: Period,
    ) -> Result<Vec<PartitionDescriptor>> {
        let catalog = self.backend.list_partitions(table).await?;
        Ok(descriptors_from_catalog(table, period, &catalog))
    }

    /// Drops the cached catalog for `table`.
    pub async fn invalidate(&self, table: &str) {
        self.cache.write().await.remove(table);
    }

    async fn refresh(&self, table: &str) -> Result<HashSet<String>> {
        let names: HashSet<String> = self
            .backend
            .list_partitions(table)
            .await?
            .into_iter()
            .map(|p| p.name)
            .collect();
        self.cache.write().await.insert(
            table.to_string(),
            CachedCatalog {
                names: names.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(names)
    }
}

fn descriptors_from_catalog(
    table: &str,
    period: Period,
    catalog: &[CatalogPartition],
) -> Vec<PartitionDescriptor> {
    let mut out: Vec<PartitionDescriptor> = Vec::with_capacity(catalog.len());
    for entry in catalog {
        let Boundary::LessThan(range_end) = entry.bound else {
            continue;
        };
        let range_start = out.last().map_or_else(
            || period.floor(range_end - chrono::Duration::milliseconds(1)),
            |prev| prev.range_end,
        );
        out.push(PartitionDescriptor {
            table_name: table.to_string(),
            period,
            range_start,
            range_end,
            partition_name: entry.name.clone(),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn catalog_ranges_are_rebuilt_contiguously() {
        let catalog = vec![
            CatalogPartition {
                name: "p20240101".into(),
                bound: Boundary::LessThan(utc(2024, 1, 2)),
            },
            CatalogPartition {
                name: "p20240102".into(),
                bound: Boundary::LessThan(utc(2024, 1, 3)),
            },
            CatalogPartition {
                name: "pmax".into(),
                bound: Boundary::MaxValue,
            },
        ];
        let parts = descriptors_from_catalog("T", Period::Day, &catalog);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].range_start, utc(2024, 1, 1));
        assert_eq!(parts[1].range_start, utc(2024, 1, 2));
        assert_eq!(parts[1].range_end, utc(2024, 1, 3));
    }

    #[test]
    fn window_around_starts_current_month() {
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap();
        let window = PartitionWindow::around(now, Duration::from_secs(7 * 24 * 3600));
        assert_eq!(window.start, utc(2024, 3, 1));
        assert_eq!(window.end, Utc.with_ymd_and_hms(2024, 3, 22, 10, 0, 0).unwrap());
    }

    #[test]
    fn window_around_saturates_out_of_range_horizons() {
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap();
        let window = PartitionWindow::around(now, Duration::from_secs(u64::MAX));
        assert_eq!(window.start, utc(2024, 3, 1));
        assert_eq!(window.end, DateTime::<Utc>::MAX_UTC);

        let window = PartitionWindow::around(now, Duration::from_secs(1 << 50));
        assert_eq!(window.end, DateTime::<Utc>::MAX_UTC);
    }
}
