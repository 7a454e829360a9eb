//! # strata-store
//!
//! Relational layer for Strata.
//!
//! - **Partition Manager**: Creates range-partitioned tables, answers
//!   "is this timestamp's partition provisioned?", extends partition windows
//! - **Paged Cursor**: Lazy keyset pagination with a one-row lookahead
//! - **Discovery State**: Convergent per-object and per-folder tracking rows
//! - **Record Sink**: Insert-ignore batch writes, one transaction per batch
//!
//! Every backend contract has an in-memory implementation ([`MemoryDatabase`])
//! and a MySQL implementation ([`MySqlDatabase`]).
//!
//! ## Example
//!
//! ```rust
//! # tokio_test::block_on(async {
//! use std::sync::Arc;
//! use strata_store::{DiscoveryStateStore, FileState, MemoryDatabase};
//!
//! let store = DiscoveryStateStore::new(Arc::new(MemoryDatabase::new()));
//! let record = store.get_or_create("bucket", "path/object.json").await.unwrap();
//! assert_eq!(record.state, FileState::Unknown);
//! # });
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod cursor;
pub mod discovery;
pub mod error;
pub mod memory;
pub mod mysql;
pub mod partition_manager;
pub mod schema;
pub mod sink;
pub mod sql;
pub mod table;

pub use cursor::{PageSource, PagedCursor};
pub use discovery::{
    DiscoveryBackend, DiscoveryRecord, DiscoveryStateStore, FailureReason, FileState,
    FolderRecord, FolderState,
};
pub use error::{Error, Result};
pub use memory::MemoryDatabase;
pub use mysql::{MySqlDatabase, MySqlQueue, MySqlSemaphore, QueueDelivery};
pub use partition_manager::{
    CatalogCacheConfig, PartitionManager, PartitionManagerConfig, PartitionWindow,
};
pub use schema::{DdlStatement, SchemaBackend};
pub use sink::{InsertBatch, RecordSink};
pub use sql::SqlValue;
pub use table::{ColumnType, TableDefinition};
