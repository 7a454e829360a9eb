//! Table definitions for partitioned fact tables and state tables.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Column storage type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    /// 64-bit signed integer (also used for epoch-millisecond timestamps).
    BigInt,
    /// Boolean flag.
    Boolean,
    /// Bounded-length string.
    VarChar(u32),
    /// Unbounded text.
    Text,
    /// Opaque bytes.
    Blob,
}

impl ColumnType {
    /// Renders the MySQL type name.
    #[must_use]
    pub fn sql_type(self) -> String {
        match self {
            Self::BigInt => "BIGINT".to_string(),
            Self::Boolean => "BOOLEAN".to_string(),
            Self::VarChar(len) => format!("VARCHAR({len})"),
            Self::Text => "TEXT".to_string(),
            Self::Blob => "MEDIUMBLOB".to_string(),
        }
    }
}

/// One column of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    /// Column name.
    pub name: String,
    /// Storage type.
    pub column_type: ColumnType,
    /// Whether NULL is allowed.
    pub nullable: bool,
}

/// Schema of a table, with optional range partitioning on a millisecond column.
///
/// MySQL requires the partitioning column to be part of every unique key, so
/// [`TableDefinition::validate`] rejects definitions where it is not in the
/// primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDefinition {
    /// Table name.
    pub name: String,
    /// Columns in insertion order.
    pub columns: Vec<ColumnDefinition>,
    /// Natural key columns; duplicates on this key are ignored on insert.
    pub primary_key: Vec<String>,
    /// BIGINT epoch-millisecond column used for range partitioning.
    pub partition_column: Option<String>,
}

impl TableDefinition {
    /// Starts a definition with no columns.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            partition_column: None,
        }
    }

    /// Adds a NOT NULL column.
    #[must_use]
    pub fn column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.push(ColumnDefinition {
            name: name.into(),
            column_type,
            nullable: false,
        });
        self
    }

    /// Adds a nullable column.
    #[must_use]
    pub fn nullable_column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.push(ColumnDefinition {
            name: name.into(),
            column_type,
            nullable: true,
        });
        self
    }

    /// Sets the primary key.
    #[must_use]
    pub fn primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| (*c).to_string()).collect();
        self
    }

    /// Declares the column range partitions are computed on.
    #[must_use]
    pub fn partitioned_on(mut self, column: impl Into<String>) -> Self {
        self.partition_column = Some(column.into());
        self
    }

    /// Position of `column`, if present.
    #[must_use]
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == column)
    }

    /// Positions of the primary key columns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDefinition`] if a key column is not defined.
    pub fn key_indices(&self) -> Result<Vec<usize>> {
        self.primary_key
            .iter()
            .map(|k| {
                self.column_index(k).ok_or_else(|| Error::InvalidDefinition {
                    message: format!("{}: primary key column '{k}' is not defined", self.name),
                })
            })
            .collect()
    }

    /// Checks the definition is internally consistent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDefinition`] for empty names, missing columns,
    /// or a partition column that is not a BIGINT primary-key column.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidDefinition {
                message: "table name cannot be empty".into(),
            });
        }
        if self.columns.is_empty() {
            return Err(Error::InvalidDefinition {
                message: format!("{}: no columns", self.name),
            });
        }
        if self.primary_key.is_empty() {
            return Err(Error::InvalidDefinition {
                message: format!("{}: no primary key", self.name),
            });
        }
        self.key_indices()?;

        if let Some(column) = &self.partition_column {
            let idx = self.column_index(column).ok_or_else(|| Error::InvalidDefinition {
                message: format!("{}: partition column '{column}' is not defined", self.name),
            })?;
            if self.columns[idx].column_type != ColumnType::BigInt {
                return Err(Error::InvalidDefinition {
                    message: format!("{}: partition column '{column}' must be BIGINT", self.name),
                });
            }
            if !self.primary_key.contains(column) {
                return Err(Error::InvalidDefinition {
                    message: format!(
                        "{}: partition column '{column}' must be part of the primary key",
                        self.name
                    ),
                });
            }
        }
        Ok(())
    }
}
