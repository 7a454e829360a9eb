//! Storage event notifications.
//!
//! Parses S3-style event JSON into [`ObjectSummary`] values. Object keys in
//! these events are form-URL-encoded (`+` for space, `%XX` escapes).

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use strata_core::ObjectSummary;

use crate::error::{Error, Result};

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EventEnvelope {
    #[serde(default)]
    records: Vec<EventRecord>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventRecord {
    #[serde(default)]
    event_time: Option<DateTime<Utc>>,
    s3: S3Entity,
}

#[derive(Deserialize)]
struct S3Entity {
    bucket: BucketEntity,
    object: ObjectEntity,
}

#[derive(Deserialize)]
struct BucketEntity {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectEntity {
    key: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    e_tag: Option<String>,
}

/// Parses an event notification body into one summary per record.
///
/// # Errors
///
/// Returns [`Error::MalformedMessage`] if the body is not an event document or
/// a key is not validly encoded.
pub fn parse_event_json(body: &str) -> Result<Vec<ObjectSummary>> {
    let envelope: EventEnvelope = serde_json::from_str(body)
        .map_err(|e| Error::malformed(format!("invalid event notification: {e}")))?;

    envelope
        .records
        .into_iter()
        .map(|record| {
            Ok(ObjectSummary {
                bucket: record.s3.bucket.name,
                key: decode_key(&record.s3.object.key)?,
                etag: record.s3.object.e_tag,
                size: record.s3.object.size,
                last_modified: record.event_time,
            })
        })
        .collect()
}

/// Decodes a form-URL-encoded object key.
///
/// # Errors
///
/// Returns [`Error::MalformedMessage`] for truncated or non-hex escapes, or
/// escapes that do not form UTF-8.
pub fn decode_key(encoded: &str) -> Result<String> {
    let bytes = encoded.as_bytes();
    let bad_escape = encoded.match_indices('%').any(|(i, _)| {
        !matches!(bytes.get(i + 1..i + 3), Some(hex) if hex.iter().all(u8::is_ascii_hexdigit))
    });
    if bad_escape {
        return Err(Error::malformed(format!("bad escape in key: {encoded}")));
    }
    percent_decode_str(&encoded.replace('+', " "))
        .decode_utf8()
        .map(Cow::into_owned)
        .map_err(|_| Error::malformed(format!("key is not UTF-8: {encoded}")))
}
