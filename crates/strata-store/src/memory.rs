//! In-memory relational backend for tests and local runs.
//!
//! Models the behavior the MySQL backend relies on: conditional table
//! creation, range partitions with a trailing catch-all, insert-ignore on the
//! primary key, and atomic batch inserts. Thread-safe via `RwLock`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use strata_core::partition::{Boundary, CATCH_ALL_PARTITION, PartitionDescriptor};

use crate::discovery::{
    DiscoveryBackend, DiscoveryRecord, FileState, FileStateUpdate, FolderRecord, FolderState,
};
use crate::error::{Error, Result};
use crate::schema::{CatalogPartition, DdlStatement, SchemaBackend};
use crate::sink::{InsertBatch, RecordSink};
use crate::sql::SqlValue;
use crate::table::TableDefinition;

#[derive(Debug)]
struct MemoryTable {
    definition: TableDefinition,
    partitions: Option<Vec<CatalogPartition>>,
    rows: BTreeMap<Vec<SqlValue>, Vec<SqlValue>>,
}

impl MemoryTable {
    fn partition_of(&self, row: &[SqlValue]) -> Option<&str> {
        let partitions = self.partitions.as_ref()?;
        let column = self.definition.partition_column.as_deref()?;
        let millis = row.get(self.definition.column_index(column)?)?.as_i64()?;
        partitions
            .iter()
            .find(|p| match p.bound {
                Boundary::LessThan(t) => millis < t.timestamp_millis(),
                Boundary::MaxValue => true,
            })
            .map(|p| p.name.as_str())
    }
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, MemoryTable>,
    files: BTreeMap<(String, String), DiscoveryRecord>,
    folders: BTreeMap<(String, String), FolderRecord>,
    ddl_log: Vec<String>,
}

/// In-memory database implementing every relational backend trait.
#[derive(Debug, Default, Clone)]
pub struct MemoryDatabase {
    state: Arc<RwLock<State>>,
}

fn poison_err() -> Error {
    Error::database("memory database lock poisoned")
}

fn catalog_entries(partitions: &[PartitionDescriptor]) -> Vec<CatalogPartition> {
    partitions
        .iter()
        .map(|p| CatalogPartition {
            name: p.partition_name.clone(),
            bound: Boundary::LessThan(p.range_end),
        })
        .collect()
}

impl MemoryDatabase {
    /// Creates an empty database.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rendered text of every DDL statement executed, in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn ddl_log(&self) -> Result<Vec<String>> {
        Ok(self.state.read().map_err(|_| poison_err())?.ddl_log.clone())
    }

    /// All rows of `table` in key order, laid out like its definition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TableNotFound`] for unknown tables.
    pub fn rows(&self, table: &str) -> Result<Vec<Vec<SqlValue>>> {
        let state = self.state.read().map_err(|_| poison_err())?;
        let t = state
            .tables
            .get(table)
            .ok_or_else(|| Error::table_not_found(table))?;
        Ok(t.rows.values().cloned().collect())
    }

    /// Number of rows in `table`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TableNotFound`] for unknown tables.
    pub fn row_count(&self, table: &str) -> Result<usize> {
        self.rows(table).map(|r| r.len())
    }

    /// Number of rows of `table` stored in `partition`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TableNotFound`] for unknown tables.
    pub fn rows_in_partition(&self, table: &str, partition: &str) -> Result<usize> {
        let state = self.state.read().map_err(|_| poison_err())?;
        let t = state
            .tables
            .get(table)
            .ok_or_else(|| Error::table_not_found(table))?;
        Ok(t.rows
            .values()
            .filter(|row| t.partition_of(row) == Some(partition))
            .count())
    }

    /// Lists folders regardless of state, ordered by `(bucket, path)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn folders(&self) -> Result<Vec<FolderRecord>> {
        let state = self.state.read().map_err(|_| poison_err())?;
        Ok(state.folders.values().cloned().collect())
    }
}

fn apply_ddl(state: &mut State, statement: &DdlStatement) -> Result<()> {
    match statement {
        DdlStatement::CreateTable {
            definition,
            partitions,
        } => {
            if state.tables.contains_key(&definition.name) {
                return Ok(());
            }
            let partitions = partitions.as_ref().map(|parts| {
                let mut entries = catalog_entries(parts);
                entries.push(CatalogPartition {
                    name: CATCH_ALL_PARTITION.to_string(),
                    bound: Boundary::MaxValue,
                });
                entries
            });
            state.tables.insert(
                definition.name.clone(),
                MemoryTable {
                    definition: definition.clone(),
                    partitions,
                    rows: BTreeMap::new(),
                },
            );
            Ok(())
        }
        DdlStatement::ReorganizeCatchAll { table, partitions } => {
            let t = state
                .tables
                .get_mut(table)
                .ok_or_else(|| Error::table_not_found(table.clone()))?;
            let mut existing = t.partitions.clone().ok_or_else(|| {
                Error::database(format!("{table}: partition management on a non-partitioned table"))
            })?;
            if existing.last().map(|p| p.name.as_str()) != Some(CATCH_ALL_PARTITION) {
                return Err(Error::database(format!("{table}: no catch-all partition")));
            }
            existing.pop();

            let mut last_bound = existing.last().map(|p| p.bound);
            for entry in catalog_entries(partitions) {
                if existing.iter().any(|p| p.name == entry.name) {
                    return Err(Error::database(format!(
                        "{table}: duplicate partition name {}",
                        entry.name
                    )));
                }
                if last_bound.is_some_and(|b| entry.bound <= b) {
                    return Err(Error::database(format!(
                        "{table}: VALUES LESS THAN value must be strictly increasing"
                    )));
                }
                last_bound = Some(entry.bound);
                existing.push(entry);
            }
            existing.push(CatalogPartition {
                name: CATCH_ALL_PARTITION.to_string(),
                bound: Boundary::MaxValue,
            });
            t.partitions = Some(existing);
            Ok(())
        }
    }
}

#[async_trait]
impl SchemaBackend for MemoryDatabase {
    async fn execute_ddl(&self, statement: &DdlStatement) -> Result<()> {
        let mut state = self.state.write().map_err(|_| poison_err())?;
        apply_ddl(&mut state, statement)?;
        state.ddl_log.push(statement.sql());
        Ok(())
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let state = self.state.read().map_err(|_| poison_err())?;
        Ok(state.tables.contains_key(table))
    }

    async fn list_partitions(&self, table: &str) -> Result<Vec<CatalogPartition>> {
        let state = self.state.read().map_err(|_| poison_err())?;
        Ok(state
            .tables
            .get(table)
            .and_then(|t| t.partitions.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl RecordSink for MemoryDatabase {
    async fn insert_ignore(&self, batch: &InsertBatch) -> Result<u64> {
        let mut state = self.state.write().map_err(|_| poison_err())?;
        let table = state
            .tables
            .get_mut(&batch.table)
            .ok_or_else(|| Error::table_not_found(batch.table.clone()))?;

        // Lay each row out in definition order before touching the table so a
        // bad row leaves it unchanged.
        let mut laid_out = Vec::with_capacity(batch.rows.len());
        for row in &batch.rows {
            let mut full = Vec::with_capacity(table.definition.columns.len());
            for column in &table.definition.columns {
                let value = batch
                    .columns
                    .iter()
                    .position(|c| *c == column.name)
                    .and_then(|i| row.get(i).cloned())
                    .unwrap_or(SqlValue::Null);
                if value == SqlValue::Null && !column.nullable {
                    return Err(Error::database(format!(
                        "{}: column '{}' cannot be null",
                        batch.table, column.name
                    )));
                }
                full.push(value);
            }
            laid_out.push(full);
        }

        let key_indices = table.definition.key_indices()?;
        let mut inserted = 0_u64;
        for row in laid_out {
            let key: Vec<SqlValue> = key_indices.iter().map(|&i| row[i].clone()).collect();
            if let std::collections::btree_map::Entry::Vacant(slot) = table.rows.entry(key) {
                slot.insert(row);
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

#[async_trait]
impl DiscoveryBackend for MemoryDatabase {
    async fn insert_file_if_absent(
        &self,
        bucket: &str,
        key: &str,
        state: FileState,
        updated_on: DateTime<Utc>,
    ) -> Result<()> {
        let mut db = self.state.write().map_err(|_| poison_err())?;
        db.files
            .entry((bucket.to_string(), key.to_string()))
            .or_insert_with(|| DiscoveryRecord {
                bucket: bucket.to_string(),
                key: key.to_string(),
                state,
                updated_on,
                error: None,
                error_details: None,
            });
        Ok(())
    }

    async fn get_file(&self, bucket: &str, key: &str) -> Result<Option<DiscoveryRecord>> {
        let db = self.state.read().map_err(|_| poison_err())?;
        Ok(db
            .files
            .get(&(bucket.to_string(), key.to_string()))
            .cloned())
    }

    async fn update_file_state(&self, update: &FileStateUpdate) -> Result<()> {
        let mut db = self.state.write().map_err(|_| poison_err())?;
        if let Some(record) = db
            .files
            .get_mut(&(update.bucket.clone(), update.key.clone()))
        {
            record.state = update.state;
            record.updated_on = update.updated_on;
            record.error.clone_from(&update.error);
            record.error_details.clone_from(&update.error_details);
        }
        Ok(())
    }

    async fn file_exists(&self, bucket: &str, key: &str) -> Result<bool> {
        let db = self.state.read().map_err(|_| poison_err())?;
        Ok(db
            .files
            .contains_key(&(bucket.to_string(), key.to_string())))
    }

    async fn upsert_folder(&self, folder: &FolderRecord) -> Result<()> {
        let mut db = self.state.write().map_err(|_| poison_err())?;
        db.folders.insert(
            (folder.bucket.clone(), folder.path.clone()),
            folder.clone(),
        );
        Ok(())
    }

    async fn list_folders_page(
        &self,
        bucket: &str,
        state: FolderState,
        after_path: Option<&str>,
        limit: usize,
    ) -> Result<Vec<FolderRecord>> {
        let db = self.state.read().map_err(|_| poison_err())?;
        Ok(db
            .folders
            .values()
            .filter(|f| f.bucket == bucket && f.state == state)
            .filter(|f| after_path.is_none_or(|after| f.path.as_str() > after))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::ColumnType;
    use chrono::TimeZone;
    use strata_core::partition::{Period, partitions_between};

    fn definition() -> TableDefinition {
        TableDefinition::new("T")
            .column("TS", ColumnType::BigInt)
            .column("ID", ColumnType::BigInt)
            .nullable_column("NOTE", ColumnType::Text)
            .primary_key(&["TS", "ID"])
            .partitioned_on("TS")
    }

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
    }

    async fn create(db: &MemoryDatabase) {
        let partitions = partitions_between("T", day(1), day(3), Period::Day).unwrap();
        db.execute_ddl(&DdlStatement::CreateTable {
            definition: definition(),
            partitions: Some(partitions),
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn create_table_is_conditional() {
        let db = MemoryDatabase::new();
        create(&db).await;
        create(&db).await;
        let catalog = db.list_partitions("T").await.unwrap();
        let names: Vec<_> = catalog.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["p20240101", "p20240102", "pmax"]);
        assert_eq!(db.ddl_log().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn insert_ignore_skips_duplicate_keys() {
        let db = MemoryDatabase::new();
        create(&db).await;
        let mut batch = InsertBatch::new("T", vec!["TS".into(), "ID".into()]);
        let ts = day(1).timestamp_millis() + 5;
        batch.push(vec![ts.into(), 1_i64.into()]).unwrap();
        batch.push(vec![ts.into(), 1_i64.into()]).unwrap();
        batch.push(vec![ts.into(), 2_i64.into()]).unwrap();

        assert_eq!(db.insert_ignore(&batch).await.unwrap(), 2);
        assert_eq!(db.insert_ignore(&batch).await.unwrap(), 0);
        assert_eq!(db.row_count("T").unwrap(), 2);
        assert_eq!(db.rows_in_partition("T", "p20240101").unwrap(), 2);
        assert_eq!(db.rows("T").unwrap()[0][2], SqlValue::Null);
    }

    #[tokio::test]
    async fn insert_into_missing_table_fails() {
        let db = MemoryDatabase::new();
        let batch = InsertBatch::new("NOPE", vec!["A".into()]);
        assert!(matches!(
            db.insert_ignore(&batch).await,
            Err(Error::TableNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn reorganize_rejects_overlap() {
        let db = MemoryDatabase::new();
        create(&db).await;
        let overlapping = partitions_between("T", day(2), day(2), Period::Day).unwrap();
        let result = db
            .execute_ddl(&DdlStatement::ReorganizeCatchAll {
                table: "T".into(),
                partitions: overlapping,
            })
            .await;
        assert!(result.is_err());
        assert_eq!(db.list_partitions("T").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn folder_pages_are_ordered_and_filtered() {
        let db = MemoryDatabase::new();
        for (path, state) in [
            ("c/", FolderState::Rolling),
            ("a/", FolderState::Rolling),
            ("b/", FolderState::Collated),
        ] {
            db.upsert_folder(&FolderRecord {
                bucket: "b1".into(),
                path: path.into(),
                state,
                updated_on: Utc::now(),
            })
            .await
            .unwrap();
        }
        let page = db
            .list_folders_page("b1", FolderState::Rolling, None, 10)
            .await
            .unwrap();
        let paths: Vec<_> = page.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["a/", "c/"]);

        let after = db
            .list_folders_page("b1", FolderState::Rolling, Some("a/"), 10)
            .await
            .unwrap();
        assert_eq!(after.len(), 1);
    }
}
