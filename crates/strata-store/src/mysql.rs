//! MySQL backend (sqlx) for the schema, discovery, and sink contracts, plus a
//! row-locking counting semaphore and named work queues.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::mysql::{MySqlArguments, MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::query::Query;
use sqlx::{MySql, Row};
use strata_core::partition::{Boundary, from_millis};
use strata_core::semaphore::{CountingSemaphore, LeaseToken};
use ulid::Ulid;

use crate::discovery::{
    DiscoveryBackend, DiscoveryRecord, FileState, FileStateUpdate, FolderRecord, FolderState,
};
use crate::error::{Error, Result};
use crate::schema::{CatalogPartition, DdlStatement, SchemaBackend};
use crate::sink::{InsertBatch, RecordSink};
use crate::sql::{self, SqlValue};

/// State-table schema (embedded).
const MYSQL_SCHEMA: &str = include_str!("mysql_schema.sql");

fn schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

fn db_err(context: &'static str) -> impl FnOnce(sqlx::Error) -> Error {
    move |e| Error::database_with_source(context, e)
}

/// Parses `information_schema.PARTITIONS.PARTITION_DESCRIPTION`.
fn parse_partition_bound(description: &str) -> Result<Boundary> {
    if description.eq_ignore_ascii_case("MAXVALUE") {
        return Ok(Boundary::MaxValue);
    }
    let millis: i64 = description.trim().parse().map_err(|_| {
        Error::database(format!("unexpected partition bound '{description}'"))
    })?;
    Ok(Boundary::LessThan(from_millis(millis)?))
}

fn bind_value<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    value: &'q SqlValue,
) -> Query<'q, MySql, MySqlArguments> {
    match value {
        SqlValue::Null => query.bind(None::<i64>),
        SqlValue::BigInt(v) => query.bind(*v),
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.as_str()),
        SqlValue::Bytes(v) => query.bind(v.as_slice()),
    }
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// MySQL-backed relational store.
#[derive(Debug, Clone)]
pub struct MySqlDatabase {
    pool: MySqlPool,
}

impl MySqlDatabase {
    /// Connects to `url` and creates the state tables if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] if the URL is invalid or the connection or
    /// migration fails.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let opts = MySqlConnectOptions::from_str(url).map_err(db_err("parse database url"))?;
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await
            .map_err(db_err("connect to mysql"))?;

        let db = Self { pool };
        db.migrate().await?;
        tracing::info!(max_connections, "connected to mysql");
        Ok(db)
    }

    /// Wraps an existing pool without migrating.
    #[must_use]
    pub fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Creates the state tables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] if a statement fails.
    pub async fn migrate(&self) -> Result<()> {
        for statement in schema_statements(MYSQL_SCHEMA) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err("migrate state tables"))?;
        }
        Ok(())
    }

    /// Round-trips a trivial query.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] if the database is unreachable.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_err("health check"))?;
        Ok(())
    }

    /// Returns the connection pool.
    #[must_use]
    pub const fn pool(&self) -> &MySqlPool {
        &self.pool
    }
}

fn file_record(row: &MySqlRow) -> Result<DiscoveryRecord> {
    let state: String = row.try_get("STATE").map_err(db_err("decode FILE_STATE"))?;
    Ok(DiscoveryRecord {
        bucket: row.try_get("BUCKET").map_err(db_err("decode FILE_STATE"))?,
        key: row.try_get("S3_KEY").map_err(db_err("decode FILE_STATE"))?,
        state: state.parse()?,
        updated_on: row.try_get("UPDATED_ON").map_err(db_err("decode FILE_STATE"))?,
        error: row.try_get("ERROR").map_err(db_err("decode FILE_STATE"))?,
        error_details: row
            .try_get("ERROR_DETAILS")
            .map_err(db_err("decode FILE_STATE"))?,
    })
}

fn folder_record(row: &MySqlRow) -> Result<FolderRecord> {
    let state: String = row.try_get("STATE").map_err(db_err("decode FOLDER_STATE"))?;
    Ok(FolderRecord {
        bucket: row.try_get("BUCKET").map_err(db_err("decode FOLDER_STATE"))?,
        path: row.try_get("PATH").map_err(db_err("decode FOLDER_STATE"))?,
        state: state.parse()?,
        updated_on: row
            .try_get("UPDATED_ON")
            .map_err(db_err("decode FOLDER_STATE"))?,
    })
}

#[async_trait]
impl SchemaBackend for MySqlDatabase {
    async fn execute_ddl(&self, statement: &DdlStatement) -> Result<()> {
        let text = statement.sql();
        tracing::debug!(table = statement.table_name(), sql = %text, "executing ddl");
        sqlx::query(&text)
            .execute(&self.pool)
            .await
            .map_err(db_err("execute ddl"))?;
        Ok(())
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM information_schema.TABLES \
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?",
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("read table catalog"))?;
        Ok(count > 0)
    }

    async fn list_partitions(&self, table: &str) -> Result<Vec<CatalogPartition>> {
        let rows = sqlx::query(
            "SELECT CAST(PARTITION_NAME AS CHAR) AS NAME, \
                    CAST(PARTITION_DESCRIPTION AS CHAR) AS BOUND \
             FROM information_schema.PARTITIONS \
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? AND PARTITION_NAME IS NOT NULL \
             ORDER BY PARTITION_ORDINAL_POSITION",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("read partition catalog"))?;

        rows.iter()
            .map(|row| {
                let name: String = row.try_get("NAME").map_err(db_err("decode partition"))?;
                let bound: String = row.try_get("BOUND").map_err(db_err("decode partition"))?;
                Ok(CatalogPartition {
                    name,
                    bound: parse_partition_bound(&bound)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl RecordSink for MySqlDatabase {
    async fn insert_ignore(&self, batch: &InsertBatch) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.map_err(db_err("begin batch"))?;
        let mut inserted = 0_u64;

        for chunk in batch.rows.chunks(sql::rows_per_statement(batch.columns.len())) {
            let text = sql::render_insert_ignore(&batch.table, &batch.columns, chunk.len());
            let mut query = sqlx::query(&text);
            for value in chunk.iter().flatten() {
                query = bind_value(query, value);
            }
            inserted += query
                .execute(&mut *tx)
                .await
                .map_err(db_err("insert batch"))?
                .rows_affected();
        }

        tx.commit().await.map_err(db_err("commit batch"))?;
        Ok(inserted)
    }
}

#[async_trait]
impl DiscoveryBackend for MySqlDatabase {
    async fn insert_file_if_absent(
        &self,
        bucket: &str,
        key: &str,
        state: FileState,
        updated_on: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT IGNORE INTO FILE_STATE (BUCKET, S3_KEY, STATE, UPDATED_ON) VALUES (?, ?, ?, ?)",
        )
        .bind(bucket)
        .bind(key)
        .bind(state.as_str())
        .bind(updated_on)
        .execute(&self.pool)
        .await
        .map_err(db_err("insert FILE_STATE"))?;
        Ok(())
    }

    async fn get_file(&self, bucket: &str, key: &str) -> Result<Option<DiscoveryRecord>> {
        let row = sqlx::query(
            "SELECT BUCKET, S3_KEY, STATE, UPDATED_ON, ERROR, ERROR_DETAILS \
             FROM FILE_STATE WHERE BUCKET = ? AND S3_KEY = ?",
        )
        .bind(bucket)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("select FILE_STATE"))?;
        row.as_ref().map(file_record).transpose()
    }

    async fn update_file_state(&self, update: &FileStateUpdate) -> Result<()> {
        sqlx::query(
            "UPDATE FILE_STATE SET STATE = ?, UPDATED_ON = ?, ERROR = ?, ERROR_DETAILS = ? \
             WHERE BUCKET = ? AND S3_KEY = ?",
        )
        .bind(update.state.as_str())
        .bind(update.updated_on)
        .bind(update.error.as_deref())
        .bind(update.error_details.as_deref())
        .bind(&update.bucket)
        .bind(&update.key)
        .execute(&self.pool)
        .await
        .map_err(db_err("update FILE_STATE"))?;
        Ok(())
    }

    async fn file_exists(&self, bucket: &str, key: &str) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM FILE_STATE WHERE BUCKET = ? AND S3_KEY = ?")
                .bind(bucket)
                .bind(key)
                .fetch_one(&self.pool)
                .await
                .map_err(db_err("count FILE_STATE"))?;
        Ok(count > 0)
    }

    async fn upsert_folder(&self, folder: &FolderRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO FOLDER_STATE (BUCKET, PATH, STATE, UPDATED_ON) VALUES (?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE STATE = VALUES(STATE), UPDATED_ON = VALUES(UPDATED_ON)",
        )
        .bind(&folder.bucket)
        .bind(&folder.path)
        .bind(folder.state.as_str())
        .bind(folder.updated_on)
        .execute(&self.pool)
        .await
        .map_err(db_err("upsert FOLDER_STATE"))?;
        Ok(())
    }

    async fn list_folders_page(
        &self,
        bucket: &str,
        state: FolderState,
        after_path: Option<&str>,
        limit: usize,
    ) -> Result<Vec<FolderRecord>> {
        let rows = match after_path {
            Some(after) => {
                sqlx::query(
                    "SELECT BUCKET, PATH, STATE, UPDATED_ON FROM FOLDER_STATE \
                     WHERE BUCKET = ? AND STATE = ? AND PATH > ? ORDER BY PATH LIMIT ?",
                )
                .bind(bucket)
                .bind(state.as_str())
                .bind(after)
                .bind(limit_param(limit))
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT BUCKET, PATH, STATE, UPDATED_ON FROM FOLDER_STATE \
                     WHERE BUCKET = ? AND STATE = ? ORDER BY PATH LIMIT ?",
                )
                .bind(bucket)
                .bind(state.as_str())
                .bind(limit_param(limit))
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(db_err("list FOLDER_STATE"))?;

        rows.iter().map(folder_record).collect()
    }
}

/// Counting semaphore over `SEMAPHORE_LOCK`, one row per slot.
///
/// Acquisition locks the key's slot rows with `SELECT ... FOR UPDATE` and
/// claims the first free or expired slot in the same transaction.
#[derive(Debug, Clone)]
pub struct MySqlSemaphore {
    pool: MySqlPool,
}

impl MySqlSemaphore {
    /// Creates a semaphore over the database's pool.
    #[must_use]
    pub fn new(database: &MySqlDatabase) -> Self {
        Self {
            pool: database.pool.clone(),
        }
    }
}

fn core_err(context: &'static str) -> impl FnOnce(sqlx::Error) -> strata_core::Error {
    move |e| strata_core::Error::storage_with_source(context, e)
}

#[async_trait]
impl CountingSemaphore for MySqlSemaphore {
    async fn try_acquire(
        &self,
        key: &str,
        timeout: Duration,
        max_holders: u32,
    ) -> strata_core::Result<Option<LeaseToken>> {
        if max_holders == 0 {
            return Err(strata_core::Error::InvalidInput(
                "max_holders must be positive".into(),
            ));
        }
        let ttl = chrono::Duration::from_std(timeout).map_err(|e| {
            strata_core::Error::InvalidInput(format!("semaphore timeout out of range: {e}"))
        })?;
        let slots = i32::try_from(max_holders).unwrap_or(i32::MAX);

        let mut tx = self.pool.begin().await.map_err(core_err("begin acquire"))?;

        for slot in 0..slots {
            sqlx::query("INSERT IGNORE INTO SEMAPHORE_LOCK (LOCK_KEY, SLOT) VALUES (?, ?)")
                .bind(key)
                .bind(slot)
                .execute(&mut *tx)
                .await
                .map_err(core_err("seed semaphore slots"))?;
        }

        let rows = sqlx::query(
            "SELECT SLOT, TOKEN, EXPIRES_ON FROM SEMAPHORE_LOCK \
             WHERE LOCK_KEY = ? AND SLOT < ? ORDER BY SLOT FOR UPDATE",
        )
        .bind(key)
        .bind(slots)
        .fetch_all(&mut *tx)
        .await
        .map_err(core_err("lock semaphore slots"))?;

        let now = Utc::now();
        let mut free_slot = None;
        for row in &rows {
            let token: Option<String> = row.try_get("TOKEN").map_err(core_err("decode slot"))?;
            let expires: Option<DateTime<Utc>> =
                row.try_get("EXPIRES_ON").map_err(core_err("decode slot"))?;
            if token.is_none() || expires.is_none_or(|t| t <= now) {
                free_slot = Some(row.try_get::<i32, _>("SLOT").map_err(core_err("decode slot"))?);
                break;
            }
        }

        let Some(slot) = free_slot else {
            tx.rollback().await.map_err(core_err("rollback acquire"))?;
            return Ok(None);
        };

        let lease = LeaseToken {
            key: key.to_string(),
            token: Ulid::new().to_string(),
            expires_at: now + ttl,
        };
        sqlx::query(
            "UPDATE SEMAPHORE_LOCK SET TOKEN = ?, EXPIRES_ON = ? WHERE LOCK_KEY = ? AND SLOT = ?",
        )
        .bind(&lease.token)
        .bind(lease.expires_at)
        .bind(key)
        .bind(slot)
        .execute(&mut *tx)
        .await
        .map_err(core_err("claim semaphore slot"))?;
        tx.commit().await.map_err(core_err("commit acquire"))?;

        tracing::debug!(key, slot, token = %lease.token, "semaphore slot acquired");
        Ok(Some(lease))
    }

    async fn release(&self, lease: &LeaseToken) -> strata_core::Result<()> {
        sqlx::query(
            "UPDATE SEMAPHORE_LOCK SET TOKEN = NULL, EXPIRES_ON = NULL \
             WHERE LOCK_KEY = ? AND TOKEN = ?",
        )
        .bind(&lease.key)
        .bind(&lease.token)
        .execute(&self.pool)
        .await
        .map_err(core_err("release semaphore slot"))?;
        Ok(())
    }
}

/// One delivery of a message from a [`MySqlQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDelivery {
    /// Stable identifier of the message.
    pub message_id: String,
    /// Handle of this delivery.
    pub receipt: String,
    /// Message body.
    pub body: String,
    /// Deliveries so far, including this one.
    pub receive_count: u32,
}

/// Named work queue over `QUEUE_MESSAGE` with visibility timeouts.
///
/// Receivers lock visible rows with `FOR UPDATE SKIP LOCKED`, so concurrent
/// workers never claim the same delivery.
#[derive(Debug, Clone)]
pub struct MySqlQueue {
    pool: MySqlPool,
    name: String,
}

fn visible_on(delay: Duration) -> Result<DateTime<Utc>> {
    let delay = chrono::Duration::from_std(delay)
        .map_err(|e| Error::InvalidInput(format!("queue delay out of range: {e}")))?;
    Utc::now()
        .checked_add_signed(delay)
        .ok_or_else(|| Error::InvalidInput("queue delay out of range".into()))
}

impl MySqlQueue {
    /// Creates a handle on the queue called `name`.
    #[must_use]
    pub fn new(database: &MySqlDatabase, name: impl Into<String>) -> Self {
        Self {
            pool: database.pool.clone(),
            name: name.into(),
        }
    }

    /// Queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues `body`, visible immediately. Returns the message id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] if the insert fails.
    pub async fn send(&self, body: &str) -> Result<String> {
        let message_id = Ulid::new().to_string();
        sqlx::query(
            "INSERT INTO QUEUE_MESSAGE (QUEUE_NAME, MESSAGE_ID, BODY, VISIBLE_ON) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(&self.name)
        .bind(&message_id)
        .bind(body)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db_err("enqueue message"))?;
        Ok(message_id)
    }

    /// Claims up to `max` visible messages in send order, hiding each for
    /// `visibility` under a fresh receipt.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] if the claim transaction fails.
    pub async fn receive(&self, max: usize, visibility: Duration) -> Result<Vec<QueueDelivery>> {
        let hidden_until = visible_on(visibility)?;
        let mut tx = self.pool.begin().await.map_err(db_err("begin receive"))?;

        let rows = sqlx::query(
            "SELECT SEQ, MESSAGE_ID, BODY, RECEIVE_COUNT FROM QUEUE_MESSAGE \
             WHERE QUEUE_NAME = ? AND VISIBLE_ON <= ? ORDER BY SEQ LIMIT ? \
             FOR UPDATE SKIP LOCKED",
        )
        .bind(&self.name)
        .bind(Utc::now())
        .bind(limit_param(max))
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err("select visible messages"))?;

        let mut deliveries = Vec::with_capacity(rows.len());
        for row in &rows {
            let seq: i64 = row.try_get("SEQ").map_err(db_err("decode QUEUE_MESSAGE"))?;
            let count: i32 = row
                .try_get("RECEIVE_COUNT")
                .map_err(db_err("decode QUEUE_MESSAGE"))?;
            let receipt = Ulid::new().to_string();
            sqlx::query(
                "UPDATE QUEUE_MESSAGE SET RECEIPT = ?, VISIBLE_ON = ?, \
                 RECEIVE_COUNT = RECEIVE_COUNT + 1 WHERE SEQ = ?",
            )
            .bind(&receipt)
            .bind(hidden_until)
            .bind(seq)
            .execute(&mut *tx)
            .await
            .map_err(db_err("claim message"))?;

            deliveries.push(QueueDelivery {
                message_id: row
                    .try_get("MESSAGE_ID")
                    .map_err(db_err("decode QUEUE_MESSAGE"))?,
                receipt,
                body: row.try_get("BODY").map_err(db_err("decode QUEUE_MESSAGE"))?,
                receive_count: u32::try_from(count).unwrap_or(0).saturating_add(1),
            });
        }

        tx.commit().await.map_err(db_err("commit receive"))?;
        Ok(deliveries)
    }

    /// Hides the delivery for `visibility` from now.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an unknown or superseded receipt.
    pub async fn heartbeat(&self, receipt: &str, visibility: Duration) -> Result<()> {
        let affected = sqlx::query(
            "UPDATE QUEUE_MESSAGE SET VISIBLE_ON = ? WHERE QUEUE_NAME = ? AND RECEIPT = ?",
        )
        .bind(visible_on(visibility)?)
        .bind(&self.name)
        .bind(receipt)
        .execute(&self.pool)
        .await
        .map_err(db_err("extend visibility"))?
        .rows_affected();
        expect_receipt(affected, receipt)
    }

    /// Deletes the message behind the delivery.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an unknown or superseded receipt.
    pub async fn delete(&self, receipt: &str) -> Result<()> {
        let affected = sqlx::query("DELETE FROM QUEUE_MESSAGE WHERE QUEUE_NAME = ? AND RECEIPT = ?")
            .bind(&self.name)
            .bind(receipt)
            .execute(&self.pool)
            .await
            .map_err(db_err("delete message"))?
            .rows_affected();
        expect_receipt(affected, receipt)
    }

    /// Gives the delivery back; the message is visible again after `delay`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an unknown or superseded receipt.
    pub async fn release(&self, receipt: &str, delay: Duration) -> Result<()> {
        let affected = sqlx::query(
            "UPDATE QUEUE_MESSAGE SET RECEIPT = NULL, VISIBLE_ON = ? \
             WHERE QUEUE_NAME = ? AND RECEIPT = ?",
        )
        .bind(visible_on(delay)?)
        .bind(&self.name)
        .bind(receipt)
        .execute(&self.pool)
        .await
        .map_err(db_err("release message"))?
        .rows_affected();
        expect_receipt(affected, receipt)
    }
}

fn expect_receipt(affected: u64, receipt: &str) -> Result<()> {
    if affected == 0 {
        return Err(Error::InvalidInput(format!(
            "unknown or expired receipt: {receipt}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_splits_into_four_tables() {
        let statements = schema_statements(MYSQL_SCHEMA);
        assert_eq!(statements.len(), 4);
        assert!(statements[0].contains("`FILE_STATE`"));
        assert!(statements[1].contains("`FOLDER_STATE`"));
        assert!(statements[2].contains("`SEMAPHORE_LOCK`"));
        assert!(statements[3].contains("`QUEUE_MESSAGE`"));
    }

    #[test]
    fn queue_delays_must_be_representable() {
        assert!(visible_on(Duration::from_secs(60)).unwrap() > Utc::now());
        assert!(matches!(
            visible_on(Duration::from_secs(u64::MAX)),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn stale_receipts_are_rejected() {
        assert!(expect_receipt(1, "r1").is_ok());
        let err = expect_receipt(0, "r1").unwrap_err();
        assert!(err.to_string().contains("unknown or expired receipt: r1"));
    }

    #[test]
    fn partition_bounds_parse() {
        assert_eq!(parse_partition_bound("MAXVALUE").unwrap(), Boundary::MaxValue);
        assert_eq!(
            parse_partition_bound("1704153600000").unwrap(),
            Boundary::LessThan(from_millis(1_704_153_600_000).unwrap())
        );
        assert!(parse_partition_bound("'2024-01-01'").is_err());
    }

    #[test]
    fn limit_saturates() {
        assert_eq!(limit_param(1001), 1001);
        assert_eq!(limit_param(usize::MAX), i64::MAX);
    }
}
