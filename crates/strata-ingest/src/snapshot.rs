//! Snapshot kinds: the target table, partitioning and converter for each
//! artifact stream.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_core::partition::Period;
use strata_store::{ColumnType, SqlValue, TableDefinition};

use crate::error::{Error, Result};
use crate::records::{
    AccessRecord, BulkFileDownloadRecord, ObjectRecord, TeamMemberSnapshot, UserAccessRecord,
};

/// Table of team membership snapshots.
pub const TEAM_MEMBER_SNAPSHOT_TABLE: &str = "TEAM_MEMBER_SNAPSHOT";
/// Table of files delivered by bulk downloads.
pub const BULK_FILE_DOWNLOAD_RECORD_TABLE: &str = "BULK_FILE_DOWNLOAD_RECORD";
/// Table of daily per-client user access.
pub const USER_ACCESS_RECORD_TABLE: &str = "USER_ACCESS_RECORD";

/// One raw line of an artifact, typed by the kind that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawRecord {
    /// An object snapshot envelope.
    Object(ObjectRecord),
    /// An access log row.
    Access(AccessRecord),
}

/// A converted row ready for admission and insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertedRow {
    /// Value of the partitioning column.
    pub partition_time: DateTime<Utc>,
    /// Column values in table definition order.
    pub values: Vec<SqlValue>,
}

/// The artifact streams the warehouse ingests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotKind {
    /// Team membership snapshots, partitioned weekly.
    TeamMember,
    /// Bulk download responses, one row per delivered file, partitioned daily.
    BulkFileDownload,
    /// Access log rows collapsed to daily per-client access, partitioned monthly.
    UserAccess,
}

impl SnapshotKind {
    /// Every kind.
    pub const ALL: [Self; 3] = [Self::TeamMember, Self::BulkFileDownload, Self::UserAccess];

    /// Stable identifier used in configuration and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TeamMember => "TEAM_MEMBER",
            Self::BulkFileDownload => "BULK_FILE_DOWNLOAD",
            Self::UserAccess => "USER_ACCESS",
        }
    }

    /// Target table.
    #[must_use]
    pub const fn table(self) -> &'static str {
        match self {
            Self::TeamMember => TEAM_MEMBER_SNAPSHOT_TABLE,
            Self::BulkFileDownload => BULK_FILE_DOWNLOAD_RECORD_TABLE,
            Self::UserAccess => USER_ACCESS_RECORD_TABLE,
        }
    }

    /// Partition period of the target table.
    #[must_use]
    pub const fn period(self) -> Period {
        match self {
            Self::TeamMember => Period::Week,
            Self::BulkFileDownload => Period::Day,
            Self::UserAccess => Period::Month,
        }
    }

    /// Object key path segment marking the kind's artifact stream.
    #[must_use]
    pub const fn key_segment(self) -> &'static str {
        match self {
            Self::TeamMember => "teamMemberSnapshots",
            Self::BulkFileDownload => "bulkFileDownloadResponses",
            Self::UserAccess => "userAccessRecords",
        }
    }

    /// Prefix for the kind's temporary artifact files.
    #[must_use]
    pub const fn temp_file_prefix(self) -> &'static str {
        match self {
            Self::TeamMember => "collatedTeamMemberSnapshot",
            Self::BulkFileDownload => "collatedBulkFileDownloadRecord",
            Self::UserAccess => "collatedUserAccessRecord",
        }
    }

    /// Schema of the target table.
    #[must_use]
    pub fn definition(self) -> TableDefinition {
        match self {
            Self::TeamMember => TableDefinition::new(TEAM_MEMBER_SNAPSHOT_TABLE)
                .column("TIMESTAMP", ColumnType::BigInt)
                .column("TEAM_ID", ColumnType::BigInt)
                .column("MEMBER_ID", ColumnType::BigInt)
                .column("IS_ADMIN", ColumnType::Boolean)
                .primary_key(&["TIMESTAMP", "TEAM_ID", "MEMBER_ID"])
                .partitioned_on("TIMESTAMP"),
            Self::BulkFileDownload => TableDefinition::new(BULK_FILE_DOWNLOAD_RECORD_TABLE)
                .column("TIMESTAMP", ColumnType::BigInt)
                .column("USER_ID", ColumnType::BigInt)
                .column("OBJECT_ID", ColumnType::BigInt)
                .column("OBJECT_TYPE", ColumnType::VarChar(64))
                .column("ASSOCIATED_OBJECT_ID", ColumnType::BigInt)
                .column("ASSOCIATED_OBJECT_TYPE", ColumnType::VarChar(64))
                .primary_key(&["TIMESTAMP", "USER_ID", "OBJECT_ID", "ASSOCIATED_OBJECT_ID"])
                .partitioned_on("TIMESTAMP"),
            Self::UserAccess => TableDefinition::new(USER_ACCESS_RECORD_TABLE)
                .column("USER_ID", ColumnType::BigInt)
                .column("DATE", ColumnType::BigInt)
                .column("CLIENT", ColumnType::VarChar(32))
                .primary_key(&["USER_ID", "DATE", "CLIENT"])
                .partitioned_on("DATE"),
        }
    }

    /// Parses one artifact line into this kind's raw record type.
    ///
    /// # Errors
    ///
    /// Returns the JSON error if the line is not a valid raw record.
    pub fn parse_line(self, line: &str) -> serde_json::Result<RawRecord> {
        match self {
            Self::TeamMember | Self::BulkFileDownload => {
                serde_json::from_str(line).map(RawRecord::Object)
            }
            Self::UserAccess => serde_json::from_str(line).map(RawRecord::Access),
        }
    }

    /// Converts a raw record into zero or more rows.
    ///
    /// Returns `None` when the record is invalid and must be dropped.
    #[must_use]
    pub fn convert(self, raw: &RawRecord) -> Option<Vec<ConvertedRow>> {
        match (self, raw) {
            (Self::TeamMember, RawRecord::Object(record)) => {
                let snapshot = TeamMemberSnapshot::from_object_record(record)?;
                Some(vec![ConvertedRow {
                    partition_time: snapshot.timestamp,
                    values: snapshot.to_row(),
                }])
            }
            (Self::BulkFileDownload, RawRecord::Object(record)) => {
                let records = BulkFileDownloadRecord::from_object_record(record)?;
                Some(
                    records
                        .iter()
                        .map(|r| ConvertedRow {
                            partition_time: r.timestamp,
                            values: r.to_row(),
                        })
                        .collect(),
                )
            }
            (Self::UserAccess, RawRecord::Access(record)) => {
                let access = UserAccessRecord::from_access_record(record)?;
                Some(vec![ConvertedRow {
                    partition_time: access.day_start(),
                    values: access.to_row(),
                }])
            }
            _ => None,
        }
    }
}

impl fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SnapshotKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::InvalidInput(format!("unknown snapshot kind: {s}")))
    }
}
