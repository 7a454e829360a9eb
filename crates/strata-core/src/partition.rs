//! Time-partition scheme: pure functions from timestamps to partition slices.
//!
//! Every partitioned table is range-partitioned on an epoch-millisecond column.
//! A [`Period`] decides how the time axis is sliced:
//!
//! ```text
//! DAY    [2024-01-02T00:00Z, 2024-01-03T00:00Z)  -> p20240102
//! WEEK   [2024-01-01T00:00Z, 2024-01-08T00:00Z)  -> p20240101   (weeks start on Monday)
//! MONTH  [2024-01-01T00:00Z, 2024-02-01T00:00Z)  -> p20240101
//! ```
//!
//! After the last provisioned slice a table always carries one catch-all
//! partition ([`CATCH_ALL_PARTITION`], `VALUES LESS THAN MAXVALUE`). Rows landing
//! there are not "admitted": admission asks for the slice's own partition name.
//!
//! # Example
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use strata_core::partition::{partition_for, Period};
//!
//! let ts = Utc.with_ymd_and_hms(2024, 1, 2, 12, 0, 0).unwrap();
//! let p = partition_for("ACCESS_RECORD", ts, Period::Day);
//! assert_eq!(p.partition_name, "p20240102");
//! assert!(p.contains(ts));
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Name of the trailing catch-all partition of every partitioned table.
pub const CATCH_ALL_PARTITION: &str = "pmax";

/// Granularity of a table's partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Period {
    /// One partition per UTC day.
    Day,
    /// One partition per ISO week (Monday 00:00 UTC).
    Week,
    /// One partition per calendar month (day 1, 00:00 UTC).
    Month,
}

impl Period {
    /// Returns the partition boundary at or before `t`.
    #[must_use]
    pub fn floor(self, t: DateTime<Utc>) -> DateTime<Utc> {
        let date = t.date_naive();
        let start = match self {
            Self::Day => date,
            Self::Week => {
                date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
            }
            Self::Month => date.with_day(1).unwrap_or(date),
        };
        midnight(start)
    }

    /// Returns the boundary following the aligned boundary `boundary`.
    ///
    /// Saturates at the largest representable instant.
    #[must_use]
    pub fn next(self, boundary: DateTime<Utc>) -> DateTime<Utc> {
        let next = match self {
            Self::Day => boundary.checked_add_signed(Duration::days(1)),
            Self::Week => boundary.checked_add_signed(Duration::days(7)),
            Self::Month => boundary.checked_add_months(Months::new(1)),
        };
        next.unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Returns the canonical upper-case name (`DAY`, `WEEK`, `MONTH`).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Day => "DAY",
            Self::Week => "WEEK",
            Self::Month => "MONTH",
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Period {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DAY" => Ok(Self::Day),
            "WEEK" => Ok(Self::Week),
            "MONTH" => Ok(Self::Month),
            other => Err(Error::InvalidInput(format!("unknown partition period '{other}'"))),
        }
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// One provisioned time slice of a partitioned table.
///
/// Descriptors are never mutated. Maintenance supersedes the catch-all by
/// adding new descriptors after the last one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionDescriptor {
    /// Table the partition belongs to.
    pub table_name: String,
    /// Slice granularity.
    pub period: Period,
    /// Inclusive lower bound.
    pub range_start: DateTime<Utc>,
    /// Exclusive upper bound.
    pub range_end: DateTime<Utc>,
    /// Physical partition name (`pYYYYMMDD` of `range_start`).
    pub partition_name: String,
}

impl PartitionDescriptor {
    /// Returns true if `t` falls within `[range_start, range_end)`.
    #[must_use]
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.range_start <= t && t < self.range_end
    }

    /// Lower bound in epoch milliseconds.
    #[must_use]
    pub fn start_millis(&self) -> i64 {
        self.range_start.timestamp_millis()
    }

    /// Upper bound in epoch milliseconds (the `VALUES LESS THAN` value).
    #[must_use]
    pub fn end_millis(&self) -> i64 {
        self.range_end.timestamp_millis()
    }
}

/// Upper edge of a range partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Boundary {
    /// `VALUES LESS THAN (t)` for a bounded slice.
    LessThan(DateTime<Utc>),
    /// `VALUES LESS THAN MAXVALUE` for the catch-all.
    MaxValue,
}

impl Boundary {
    /// Renders the bound as used in a `VALUES LESS THAN` clause.
    #[must_use]
    pub fn sql_bound(&self) -> String {
        match self {
            Self::LessThan(t) => format!("({})", t.timestamp_millis()),
            Self::MaxValue => "MAXVALUE".to_string(),
        }
    }
}

/// Returns the partition name for the slice containing `t`.
#[must_use]
pub fn partition_name(t: DateTime<Utc>, period: Period) -> String {
    period.floor(t).format("p%Y%m%d").to_string()
}

/// Computes the partition covering `timestamp`.
#[must_use]
pub fn partition_for(table: &str, timestamp: DateTime<Utc>, period: Period) -> PartitionDescriptor {
    let range_start = period.floor(timestamp);
    PartitionDescriptor {
        table_name: table.to_string(),
        period,
        range_start,
        range_end: period.next(range_start),
        partition_name: range_start.format("p%Y%m%d").to_string(),
    }
}

/// Computes the partition covering an epoch-millisecond timestamp.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if `millis` is outside the representable range.
pub fn partition_for_millis(table: &str, millis: i64, period: Period) -> Result<PartitionDescriptor> {
    let ts = from_millis(millis)?;
    Ok(partition_for(table, ts, period))
}

/// Converts epoch milliseconds to a UTC instant.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if `millis` is outside the representable range.
pub fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| Error::InvalidInput(format!("timestamp out of range: {millis}ms")))
}

/// Enumerates every slice from the one containing `start` while the slice
/// begins before `end`. Always returns at least one slice.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if `start > end`.
pub fn partitions_between(
    table: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    period: Period,
) -> Result<Vec<PartitionDescriptor>> {
    if start > end {
        return Err(Error::InvalidInput(format!(
            "partition window start {start} is after end {end}"
        )));
    }

    let mut slices = vec![partition_for(table, start, period)];
    loop {
        let Some(last) = slices.last() else { break };
        let next_start = last.range_end;
        if next_start >= end || next_start == DateTime::<Utc>::MAX_UTC {
            break;
        }
        slices.push(partition_for(table, next_start, period));
    }
    Ok(slices)
}

/// Enumerates the partition edges between `start` and `end`.
///
/// The result is strictly increasing and ends with exactly one
/// [`Boundary::MaxValue`]. `start == end` yields one bounded edge plus the
/// catch-all.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if `start > end`.
pub fn boundaries_between(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    period: Period,
) -> Result<Vec<Boundary>> {
    let mut edges: Vec<Boundary> = partitions_between("", start, end, period)?
        .into_iter()
        .map(|p| Boundary::LessThan(p.range_end))
        .collect();
    edges.push(Boundary::MaxValue);
    Ok(edges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn day_floor_is_midnight() {
        assert_eq!(Period::Day.floor(utc(2024, 1, 2, 12)), utc(2024, 1, 2, 0));
        assert_eq!(Period::Day.floor(utc(2024, 1, 2, 0)), utc(2024, 1, 2, 0));
    }

    #[test]
    fn week_floor_is_monday() {
        // 2024-01-04 is a Thursday; its week starts Monday 2024-01-01.
        assert_eq!(Period::Week.floor(utc(2024, 1, 4, 9)), utc(2024, 1, 1, 0));
        // Sunday belongs to the week that started the previous Monday.
        assert_eq!(Period::Week.floor(utc(2024, 1, 7, 23)), utc(2024, 1, 1, 0));
        assert_eq!(Period::Week.next(utc(2024, 1, 1, 0)), utc(2024, 1, 8, 0));
    }

    #[test]
    fn month_floor_and_next_cross_year() {
        assert_eq!(Period::Month.floor(utc(2023, 12, 31, 23)), utc(2023, 12, 1, 0));
        assert_eq!(Period::Month.next(utc(2023, 12, 1, 0)), utc(2024, 1, 1, 0));
        assert_eq!(Period::Month.next(utc(2024, 1, 1, 0)), utc(2024, 2, 1, 0));
    }

    #[test]
    fn partition_name_uses_range_start() {
        let p = partition_for("T", utc(2024, 2, 29, 18), Period::Month);
        assert_eq!(p.partition_name, "p20240201");
        assert_eq!(p.range_end, utc(2024, 3, 1, 0));
        assert_eq!(partition_name(utc(2024, 2, 29, 18), Period::Day), "p20240229");
    }

    #[test]
    fn three_day_window_has_three_slices_and_catch_all() {
        let edges =
            boundaries_between(utc(2024, 1, 1, 0), utc(2024, 1, 4, 0), Period::Day).unwrap();
        assert_eq!(
            edges,
            vec![
                Boundary::LessThan(utc(2024, 1, 2, 0)),
                Boundary::LessThan(utc(2024, 1, 3, 0)),
                Boundary::LessThan(utc(2024, 1, 4, 0)),
                Boundary::MaxValue,
            ]
        );
    }

    #[test]
    fn point_window_yields_single_pair() {
        let t = utc(2024, 5, 5, 5);
        let edges = boundaries_between(t, t, Period::Day).unwrap();
        assert_eq!(edges, vec![Boundary::LessThan(utc(2024, 5, 6, 0)), Boundary::MaxValue]);
    }

    #[test]
    fn unaligned_end_includes_its_slice() {
        let slices =
            partitions_between("T", utc(2024, 1, 1, 0), utc(2024, 1, 3, 6), Period::Day).unwrap();
        let names: Vec<_> = slices.iter().map(|p| p.partition_name.as_str()).collect();
        assert_eq!(names, vec!["p20240101", "p20240102", "p20240103"]);
    }

    #[test]
    fn reversed_window_is_rejected() {
        let result = boundaries_between(utc(2024, 1, 2, 0), utc(2024, 1, 1, 0), Period::Day);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn boundary_sql_rendering() {
        let t = utc(2024, 1, 2, 0);
        assert_eq!(Boundary::LessThan(t).sql_bound(), format!("({})", t.timestamp_millis()));
        assert_eq!(Boundary::MaxValue.sql_bound(), "MAXVALUE");
    }

    #[test]
    fn period_parse_roundtrip() {
        for p in [Period::Day, Period::Week, Period::Month] {
            assert_eq!(p.as_str().parse::<Period>().unwrap(), p);
        }
        assert!("hour".parse::<Period>().is_err());
    }

    #[test]
    fn from_millis_rejects_out_of_range() {
        assert!(from_millis(i64::MAX).is_err());
        assert_eq!(from_millis(0).unwrap(), DateTime::<Utc>::UNIX_EPOCH);
    }
}
