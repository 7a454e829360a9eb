//! Idempotent batched writes into fact tables.

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::sql::SqlValue;

/// Rows destined for one table, all with the same column layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertBatch {
    /// Target table.
    pub table: String,
    /// Column names, in the order of each row's values.
    pub columns: Vec<String>,
    /// Row values.
    pub rows: Vec<Vec<SqlValue>>,
}

impl InsertBatch {
    /// Starts an empty batch.
    #[must_use]
    pub fn new(table: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            table: table.into(),
            columns,
            rows: Vec::new(),
        }
    }

    /// Appends a row.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the row width does not match the columns.
    pub fn push(&mut self, row: Vec<SqlValue>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(Error::InvalidInput(format!(
                "{}: row has {} values for {} columns",
                self.table,
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the batch has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Takes the rows out, leaving an empty batch with the same layout.
    #[must_use]
    pub fn take(&mut self) -> Self {
        Self {
            table: self.table.clone(),
            columns: self.columns.clone(),
            rows: std::mem::take(&mut self.rows),
        }
    }
}

/// Writes batches with insert-ignore semantics.
///
/// Rows whose natural key already exists are skipped, so replaying a batch
/// never duplicates data.
#[async_trait]
pub trait RecordSink: Send + Sync + 'static {
    /// Inserts the batch in one transaction; returns the number of new rows.
    async fn insert_ignore(&self, batch: &InsertBatch) -> Result<u64>;
}
