//! Raw artifact rows and the warehouse records derived from them.
//!
//! Artifacts are JSON-lines files. Object snapshots arrive as [`ObjectRecord`]
//! envelopes carrying the serialized entity in `jsonString`; access logs arrive
//! as [`AccessRecord`] rows. Each `from_*` constructor returns `None` when the
//! input cannot produce a complete record.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strata_core::partition::from_millis;
use strata_store::SqlValue;

/// Class name of team membership snapshots.
pub const TEAM_MEMBER_CLASS: &str = "org.sagebionetworks.repo.model.TeamMember";

/// Class name of bulk download responses.
pub const BULK_FILE_DOWNLOAD_RESPONSE_CLASS: &str =
    "org.sagebionetworks.repo.model.file.BulkFileDownloadResponse";

/// Object type recorded for each file in a bulk download.
pub const FILE_HANDLE_OBJECT_TYPE: &str = "FILE_HANDLE";

const SUCCESS_STATUS: &str = "SUCCESS";

/// Envelope around one snapshotted entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRecord {
    /// Epoch milliseconds at which the snapshot was taken.
    pub timestamp: i64,
    /// Fully qualified class name of the entity.
    pub json_class_name: String,
    /// The entity, serialized as JSON.
    pub json_string: String,
}

/// One request from the access log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRecord {
    /// Epoch milliseconds of the request.
    pub timestamp: i64,
    /// Authenticated user, absent for anonymous requests.
    #[serde(default)]
    pub user_id: Option<i64>,
    /// Raw `User-Agent` header.
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Request path.
    #[serde(default)]
    pub request_url: Option<String>,
    /// HTTP method.
    #[serde(default)]
    pub method: Option<String>,
    /// HTTP response status.
    #[serde(default)]
    pub response_status: Option<i64>,
}

/// Kind of client that issued a request, derived from its user agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Client {
    /// Browser-based web client.
    Web,
    /// Java client library.
    Java,
    /// Python client library.
    Python,
    /// R client library.
    R,
    /// Command line client.
    CommandLine,
    /// Load balancer health checks.
    ElbHealthchecker,
    /// Anything else.
    Unknown,
}

impl Client {
    /// Classifies a user agent string.
    #[must_use]
    pub fn from_user_agent(user_agent: Option<&str>) -> Self {
        let Some(agent) = user_agent else {
            return Self::Unknown;
        };
        let agent = agent.to_ascii_lowercase();
        // The command line client embeds the Python client's agent, so it is checked first.
        if agent.contains("synapsecommandlineclient") {
            Self::CommandLine
        } else if agent.contains("synapse-web-client") {
            Self::Web
        } else if agent.contains("synapse-java-client") {
            Self::Java
        } else if agent.contains("synapseclient") {
            Self::Python
        } else if agent.contains("synapser") {
            Self::R
        } else if agent.contains("elb-healthchecker") {
            Self::ElbHealthchecker
        } else {
            Self::Unknown
        }
    }

    /// Stored value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Web => "WEB",
            Self::Java => "JAVA",
            Self::Python => "PYTHON",
            Self::R => "R",
            Self::CommandLine => "COMMAND_LINE",
            Self::ElbHealthchecker => "ELB_HEALTHCHECKER",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// A team membership at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamMemberSnapshot {
    /// Snapshot time.
    pub timestamp: DateTime<Utc>,
    /// Team id.
    pub team_id: i64,
    /// Member's user id.
    pub member_id: i64,
    /// Whether the member administers the team.
    pub is_admin: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TeamMemberJson {
    team_id: Option<String>,
    member: Option<UserGroupHeaderJson>,
    is_admin: Option<bool>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserGroupHeaderJson {
    owner_id: Option<String>,
}

impl TeamMemberSnapshot {
    /// Builds a snapshot from a `TeamMember` envelope.
    #[must_use]
    pub fn from_object_record(record: &ObjectRecord) -> Option<Self> {
        if record.json_class_name != TEAM_MEMBER_CLASS {
            return None;
        }
        let json: TeamMemberJson = serde_json::from_str(&record.json_string).ok()?;
        Some(Self {
            timestamp: valid_timestamp(record.timestamp)?,
            team_id: parse_id(json.team_id.as_deref()?)?,
            member_id: parse_id(json.member?.owner_id.as_deref()?)?,
            is_admin: json.is_admin?,
        })
    }

    /// Values in `TEAM_MEMBER_SNAPSHOT` column order.
    #[must_use]
    pub fn to_row(&self) -> Vec<SqlValue> {
        vec![
            self.timestamp.timestamp_millis().into(),
            self.team_id.into(),
            self.member_id.into(),
            self.is_admin.into(),
        ]
    }
}

/// One file delivered by a bulk download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkFileDownloadRecord {
    /// Time of the download.
    pub timestamp: DateTime<Utc>,
    /// Downloading user.
    pub user_id: i64,
    /// Id of the downloaded file handle.
    pub object_id: i64,
    /// Type of the downloaded object.
    pub object_type: String,
    /// Id of the object the file is associated with.
    pub associated_object_id: i64,
    /// Type of the associated object, e.g. `FileEntity`.
    pub associated_object_type: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BulkFileDownloadResponseJson {
    user_id: Option<String>,
    #[serde(default)]
    file_summary: Vec<FileDownloadSummaryJson>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileDownloadSummaryJson {
    file_handle_id: Option<String>,
    associate_object_id: Option<String>,
    associate_object_type: Option<String>,
    status: Option<String>,
}

impl BulkFileDownloadRecord {
    /// Expands a `BulkFileDownloadResponse` envelope into one record per
    /// successfully delivered file.
    ///
    /// Returns `None` if the envelope is malformed, has no delivered files, or
    /// any delivered file lacks an id or type.
    #[must_use]
    pub fn from_object_record(record: &ObjectRecord) -> Option<Vec<Self>> {
        if record.json_class_name != BULK_FILE_DOWNLOAD_RESPONSE_CLASS {
            return None;
        }
        let json: BulkFileDownloadResponseJson = serde_json::from_str(&record.json_string).ok()?;
        let timestamp = valid_timestamp(record.timestamp)?;
        let user_id = parse_id(json.user_id.as_deref()?)?;

        let records = json
            .file_summary
            .iter()
            .filter(|s| s.status.as_deref() == Some(SUCCESS_STATUS))
            .map(|s| {
                let associated_object_type = s.associate_object_type.clone()?;
                if associated_object_type.trim().is_empty() {
                    return None;
                }
                Some(Self {
                    timestamp,
                    user_id,
                    object_id: parse_id(s.file_handle_id.as_deref()?)?,
                    object_type: FILE_HANDLE_OBJECT_TYPE.to_string(),
                    associated_object_id: parse_id(s.associate_object_id.as_deref()?)?,
                    associated_object_type,
                })
            })
            .collect::<Option<Vec<_>>>()?;

        if records.is_empty() {
            return None;
        }
        Some(records)
    }

    /// Values in `BULK_FILE_DOWNLOAD_RECORD` column order.
    #[must_use]
    pub fn to_row(&self) -> Vec<SqlValue> {
        vec![
            self.timestamp.timestamp_millis().into(),
            self.user_id.into(),
            self.object_id.into(),
            self.object_type.as_str().into(),
            self.associated_object_id.into(),
            self.associated_object_type.as_str().into(),
        ]
    }
}

/// A user's use of a client on a given day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAccessRecord {
    /// User id.
    pub user_id: i64,
    /// UTC calendar day of the access.
    pub date: NaiveDate,
    /// Client used.
    pub client: Client,
    /// Time of the underlying request; not stored.
    pub timestamp: DateTime<Utc>,
}

impl UserAccessRecord {
    /// Derives the daily access fact for an authenticated request.
    #[must_use]
    pub fn from_access_record(record: &AccessRecord) -> Option<Self> {
        let timestamp = valid_timestamp(record.timestamp)?;
        let user_id = record.user_id.filter(|id| *id > 0)?;
        Some(Self {
            user_id,
            date: timestamp.date_naive(),
            client: Client::from_user_agent(record.user_agent.as_deref()),
            timestamp,
        })
    }

    /// Midnight UTC of [`Self::date`]; the partitioning value of the row.
    #[must_use]
    pub fn day_start(&self) -> DateTime<Utc> {
        self.date.and_time(chrono::NaiveTime::MIN).and_utc()
    }

    /// Values in `USER_ACCESS_RECORD` column order.
    #[must_use]
    pub fn to_row(&self) -> Vec<SqlValue> {
        vec![
            self.user_id.into(),
            self.day_start().timestamp_millis().into(),
            self.client.as_str().into(),
        ]
    }
}

fn valid_timestamp(millis: i64) -> Option<DateTime<Utc>> {
    if millis <= 0 {
        return None;
    }
    from_millis(millis).ok()
}

fn parse_id(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let digits = raw.strip_prefix("syn").unwrap_or(raw);
    digits.parse().ok()
}
