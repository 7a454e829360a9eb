//! # strata-core
//!
//! Shared primitives for the Strata time-partitioned ingestion system.
//!
//! - **Partition Scheme**: Pure functions mapping timestamps to partition slices
//! - **Object Storage**: Bucket/key storage contract with conditional writes,
//!   in memory or over a local directory tree
//! - **Counting Semaphore**: Cluster-wide gating of singleton background jobs
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span helpers
//!
//! ## Example
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use strata_core::prelude::*;
//!
//! let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
//! let end = Utc.with_ymd_and_hms(2024, 1, 4, 0, 0, 0).unwrap();
//! let edges = boundaries_between(start, end, Period::Day).unwrap();
//! assert_eq!(edges.len(), 4);
//! assert_eq!(edges.last(), Some(&Boundary::MaxValue));
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod local_fs;
pub mod observability;
pub mod partition;
pub mod semaphore;
pub mod storage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::partition::{
        Boundary, CATCH_ALL_PARTITION, PartitionDescriptor, Period, boundaries_between,
        partition_for, partition_name, partitions_between,
    };
    pub use crate::semaphore::{CountingSemaphore, LeaseToken, ObjectStoreSemaphore, run_exclusive};
    pub use crate::storage::{
        MemoryObjectStore, ObjectMeta, ObjectStore, ObjectSummary, WritePrecondition, WriteResult,
    };
}

pub use error::{Error, Result};
pub use local_fs::LocalFsObjectStore;
pub use observability::{LogFormat, init_logging};
pub use partition::{Boundary, PartitionDescriptor, Period};
pub use semaphore::{CountingSemaphore, LeaseToken, ObjectStoreSemaphore, run_exclusive};
pub use storage::{MemoryObjectStore, ObjectStore, ObjectSummary, WritePrecondition, WriteResult};
