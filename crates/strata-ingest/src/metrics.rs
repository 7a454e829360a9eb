//! Ingestion metrics.
//!
//! Recorded through the `metrics` facade; the worker binary installs the
//! Prometheus recorder and describes these names.

use std::time::Instant;

use metrics::{counter, histogram};

/// Metric names.
pub mod names {
    /// Rows admitted and written (inserted or ignored as duplicates).
    pub const ROWS_ACCEPTED_TOTAL: &str = "strata_rows_accepted_total";
    /// Raw records dropped by conversion.
    pub const RECORDS_DROPPED_TOTAL: &str = "strata_records_dropped_total";
    /// Messages handled, labelled by outcome.
    pub const MESSAGES_TOTAL: &str = "strata_messages_total";
    /// Batch flush duration in seconds.
    pub const BATCH_FLUSH_DURATION: &str = "strata_batch_flush_duration_seconds";
    /// Maintenance cycles, labelled by outcome.
    pub const MAINTENANCE_CYCLES_TOTAL: &str = "strata_maintenance_cycles_total";
    /// Partitions created by maintenance.
    pub const PARTITIONS_CREATED_TOTAL: &str = "strata_partitions_created_total";
    /// Objects newly tracked by discovery.
    pub const OBJECTS_DISCOVERED_TOTAL: &str = "strata_objects_discovered_total";
}

/// Records the outcome of one message.
pub fn record_message(kind: &str, outcome: &'static str) {
    counter!(names::MESSAGES_TOTAL, "kind" => kind.to_string(), "outcome" => outcome)
        .increment(1);
}

/// Records accepted and dropped counts for one message.
pub fn record_rows(kind: &str, accepted: u64, dropped: u64) {
    counter!(names::ROWS_ACCEPTED_TOTAL, "kind" => kind.to_string()).increment(accepted);
    if dropped > 0 {
        counter!(names::RECORDS_DROPPED_TOTAL, "kind" => kind.to_string()).increment(dropped);
    }
}

/// Records a maintenance cycle.
pub fn record_maintenance(outcome: &'static str, partitions_created: u64) {
    counter!(names::MAINTENANCE_CYCLES_TOTAL, "outcome" => outcome).increment(1);
    if partitions_created > 0 {
        counter!(names::PARTITIONS_CREATED_TOTAL).increment(partitions_created);
    }
}

/// Records newly tracked objects.
pub fn record_discovered(source: &'static str, count: u64) {
    counter!(names::OBJECTS_DISCOVERED_TOTAL, "source" => source).increment(count);
}

/// Guard measuring one batch flush.
pub struct FlushTimer {
    table: String,
    start: Instant,
}

impl FlushTimer {
    /// Starts timing a flush into `table`.
    #[must_use]
    pub fn start(table: &str) -> Self {
        Self {
            table: table.to_string(),
            start: Instant::now(),
        }
    }

    /// Stops the timer and records the duration.
    pub fn finish(self) {
        histogram!(names::BATCH_FLUSH_DURATION, "table" => self.table)
            .record(self.start.elapsed().as_secs_f64());
    }
}
