//! SQL values and MySQL statement rendering.
//!
//! Identifiers are always backtick-quoted. Data values never appear in rendered
//! text: DML uses `?` placeholders and DDL only embeds partition bounds, which
//! are integers computed by the partition scheme.

use std::fmt::Write as _;
use std::iter;

use serde::{Deserialize, Serialize};
use strata_core::partition::{Boundary, CATCH_ALL_PARTITION, PartitionDescriptor};

use crate::table::TableDefinition;

/// Maximum bind parameters MySQL accepts in one prepared statement.
pub const MAX_BIND_PARAMS: usize = 65_535;

/// A single column value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// 64-bit integer.
    BigInt(i64),
    /// Boolean.
    Bool(bool),
    /// String.
    Text(String),
    /// Bytes.
    Bytes(Vec<u8>),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::BigInt(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

impl SqlValue {
    /// Returns the integer value, if this is a [`SqlValue::BigInt`].
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::BigInt(v) => Some(*v),
            _ => None,
        }
    }
}

/// Quotes an identifier with backticks.
#[must_use]
pub fn quote_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

fn partition_clauses(partitions: &[PartitionDescriptor]) -> String {
    partitions
        .iter()
        .map(|p| (p.partition_name.as_str(), Boundary::LessThan(p.range_end)))
        .chain(iter::once((CATCH_ALL_PARTITION, Boundary::MaxValue)))
        .map(|(name, bound)| format!("  PARTITION {name} VALUES LESS THAN {}", bound.sql_bound()))
        .collect::<Vec<_>>()
        .join(",\n")
}

/// Renders `CREATE TABLE IF NOT EXISTS`, range-partitioned when `partitions`
/// is given.
#[must_use]
pub fn render_create_table(
    definition: &TableDefinition,
    partitions: Option<&[PartitionDescriptor]>,
) -> String {
    let mut sql = format!("CREATE TABLE IF NOT EXISTS {} (\n", quote_ident(&definition.name));
    for column in &definition.columns {
        let null = if column.nullable { "NULL" } else { "NOT NULL" };
        let _ = writeln!(
            sql,
            "  {} {} {null},",
            quote_ident(&column.name),
            column.column_type.sql_type()
        );
    }
    let key = definition
        .primary_key
        .iter()
        .map(|k| quote_ident(k))
        .collect::<Vec<_>>()
        .join(", ");
    let _ = write!(sql, "  PRIMARY KEY ({key})\n)");

    if let (Some(partitions), Some(column)) = (partitions, &definition.partition_column) {
        let _ = write!(
            sql,
            "\nPARTITION BY RANGE ({}) (\n{}\n)",
            quote_ident(column),
            partition_clauses(partitions)
        );
    }
    sql
}

/// Renders the statement that splits the catch-all into `partitions` followed
/// by a fresh catch-all.
#[must_use]
pub fn render_reorganize_catch_all(table: &str, partitions: &[PartitionDescriptor]) -> String {
    format!(
        "ALTER TABLE {} REORGANIZE PARTITION {CATCH_ALL_PARTITION} INTO (\n{}\n)",
        quote_ident(table),
        partition_clauses(partitions)
    )
}

/// Renders a multi-row `INSERT IGNORE` with `?` placeholders.
#[must_use]
pub fn render_insert_ignore(table: &str, columns: &[String], row_count: usize) -> String {
    let cols = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let tuple = format!("({})", vec!["?"; columns.len()].join(", "));
    let values = vec![tuple.as_str(); row_count].join(", ");
    format!("INSERT IGNORE INTO {} ({cols}) VALUES {values}", quote_ident(table))
}

/// Rows per statement that keep the bind count under [`MAX_BIND_PARAMS`].
#[must_use]
pub fn rows_per_statement(column_count: usize) -> usize {
    (MAX_BIND_PARAMS / column_count.max(1)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::ColumnType;
    use chrono::{TimeZone, Utc};
    use strata_core::partition::{Period, partitions_between};

    fn definition() -> TableDefinition {
        TableDefinition::new("USER_ACCESS_RECORD")
            .column("TIMESTAMP", ColumnType::BigInt)
            .column("USER_ID", ColumnType::BigInt)
            .nullable_column("CLIENT", ColumnType::VarChar(64))
            .primary_key(&["TIMESTAMP", "USER_ID"])
            .partitioned_on("TIMESTAMP")
    }

    #[test]
    fn partitioned_ddl_embeds_bounds_and_catch_all() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 4, 0, 0, 0).unwrap();
        let parts = partitions_between("USER_ACCESS_RECORD", start, end, Period::Day).unwrap();

        let sql = render_create_table(&definition(), Some(&parts));
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS `USER_ACCESS_RECORD`"));
        assert!(sql.contains("PARTITION BY RANGE (`TIMESTAMP`)"));
        assert!(sql.contains("PARTITION p20240101 VALUES LESS THAN (1704153600000)"));
        assert!(sql.contains("PARTITION p20240103 VALUES LESS THAN (1704326400000)"));
        assert!(sql.contains("PARTITION pmax VALUES LESS THAN MAXVALUE"));
        assert!(sql.contains("`CLIENT` VARCHAR(64) NULL"));
    }

    #[test]
    fn unpartitioned_ddl_has_no_partition_clause() {
        let sql = render_create_table(&definition(), None);
        assert!(sql.contains("USER_ACCESS_RECORD"));
        assert!(!sql.contains("PARTITION"));
        assert!(sql.contains("PRIMARY KEY (`TIMESTAMP`, `USER_ID`)"));
    }

    #[test]
    fn reorganize_splits_catch_all() {
        let start = Utc.with_ymd_and_hms(2024, 1, 4, 0, 0, 0).unwrap();
        let parts = partitions_between("T", start, start, Period::Day).unwrap();
        let sql = render_reorganize_catch_all("T", &parts);
        assert!(sql.starts_with("ALTER TABLE `T` REORGANIZE PARTITION pmax INTO ("));
        assert!(sql.contains("PARTITION p20240104 VALUES LESS THAN"));
        assert!(sql.trim_end().ends_with("PARTITION pmax VALUES LESS THAN MAXVALUE\n)"));
    }

    #[test]
    fn insert_ignore_placeholders() {
        let cols = vec!["A".to_string(), "B".to_string()];
        assert_eq!(
            render_insert_ignore("T", &cols, 2),
            "INSERT IGNORE INTO `T` (`A`, `B`) VALUES (?, ?), (?, ?)"
        );
    }

    #[test]
    fn identifiers_are_escaped() {
        assert_eq!(quote_ident("a`b"), "`a``b`");
    }

    #[test]
    fn statement_chunking_respects_bind_limit() {
        assert_eq!(rows_per_statement(5), 13_107);
        assert_eq!(rows_per_statement(0), MAX_BIND_PARAMS);
    }

    #[test]
    fn option_values_map_to_null() {
        assert_eq!(SqlValue::from(None::<i64>), SqlValue::Null);
        assert_eq!(SqlValue::from(Some("x")), SqlValue::Text("x".into()));
    }
}
