//! Schema backend contract: DDL execution and the partition catalog.

use async_trait::async_trait;
use strata_core::partition::{Boundary, PartitionDescriptor};

use crate::error::Result;
use crate::sql;
use crate::table::TableDefinition;

/// A DDL statement issued by the partition manager.
///
/// Carries structured data for backends that model the catalog directly and
/// renders to MySQL text via [`DdlStatement::sql`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DdlStatement {
    /// `CREATE TABLE IF NOT EXISTS`, range-partitioned when `partitions` is set.
    CreateTable {
        /// Table schema.
        definition: TableDefinition,
        /// Initial bounded partitions; the catch-all is implied.
        partitions: Option<Vec<PartitionDescriptor>>,
    },
    /// Splits the catch-all into new bounded partitions plus a new catch-all.
    ReorganizeCatchAll {
        /// Target table.
        table: String,
        /// Partitions to add, contiguous with the last provisioned one.
        partitions: Vec<PartitionDescriptor>,
    },
}

impl DdlStatement {
    /// Table the statement applies to.
    #[must_use]
    pub fn table_name(&self) -> &str {
        match self {
            Self::CreateTable { definition, .. } => &definition.name,
            Self::ReorganizeCatchAll { table, .. } => table,
        }
    }

    /// Renders the MySQL statement text.
    #[must_use]
    pub fn sql(&self) -> String {
        match self {
            Self::CreateTable {
                definition,
                partitions,
            } => sql::render_create_table(definition, partitions.as_deref()),
            Self::ReorganizeCatchAll { table, partitions } => {
                sql::render_reorganize_catch_all(table, partitions)
            }
        }
    }
}

/// A partition as recorded in the database catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogPartition {
    /// Physical partition name.
    pub name: String,
    /// Upper bound.
    pub bound: Boundary,
}

/// Executes DDL and answers catalog questions.
#[async_trait]
pub trait SchemaBackend: Send + Sync + 'static {
    /// Executes a DDL statement.
    async fn execute_ddl(&self, statement: &DdlStatement) -> Result<()>;

    /// Returns true if the table exists.
    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// Lists a table's partitions in bound order.
    ///
    /// Returns an empty list for missing or unpartitioned tables.
    async fn list_partitions(&self, table: &str) -> Result<Vec<CatalogPartition>>;
}
