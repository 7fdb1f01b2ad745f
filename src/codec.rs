//! Record envelope codec.
//!
//! Each record is written as one compact JSON object followed by
//! [`RECORD_SEPARATOR`]. Compact JSON never contains a raw newline, so a
//! category file is a sequence of lines of the form `{...},` that only
//! becomes a JSON array once wrapped at send time. [`assemble_batch`] performs
//! that wrapping and places the array under [`BATCH_FIELD`] inside the outer
//! envelope handed to the transport.

use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_json::value::RawValue;
use thiserror::Error;

use crate::level::FemtoLevel;
use crate::record::{Category, EventRecord};

/// Separator written after every encoded record.
pub const RECORD_SEPARATOR: &str = ",\n";
/// Field of the batch envelope carrying the record array.
pub const BATCH_FIELD: &str = "logs";

#[derive(Debug, Error)]
pub enum CodecError {
    /// A metadata value could not be represented as JSON.
    #[error("metadata entry {key:?} is not serializable: {reason}")]
    MalformedMetadata { key: String, reason: String },
    #[error("failed to serialize telemetry document: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct WireRecord<'a> {
    timestamp: String,
    level: &'static str,
    source: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a BTreeMap<String, Value>>,
}

impl<'a> From<&'a EventRecord> for WireRecord<'a> {
    fn from(record: &'a EventRecord) -> Self {
        Self {
            timestamp: record
                .timestamp()
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            level: record.level().as_str(),
            source: record.source(),
            message: record.message(),
            metadata: record
                .metadata()
                .filter(|metadata| !metadata.is_empty())
                .map(|metadata| metadata.entries()),
        }
    }
}

/// Encode one record as a self-delimited fragment line.
pub fn encode(record: &EventRecord) -> Result<String, CodecError> {
    if let Some(rejected) = record.metadata().and_then(|m| m.rejected()) {
        return Err(CodecError::MalformedMetadata {
            key: rejected.key.clone(),
            reason: rejected.reason.clone(),
        });
    }
    let mut encoded = serde_json::to_string(&WireRecord::from(record))?;
    encoded.push_str(RECORD_SEPARATOR);
    Ok(encoded)
}

/// Structured form of a record read back from a fragment.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct DecodedRecord {
    pub timestamp: String,
    pub level: FemtoLevel,
    pub source: String,
    pub message: String,
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, Value>>,
}

/// Iterate over the record bodies of a fragment without their separators.
pub fn fragment_lines(fragment: &str) -> impl Iterator<Item = &str> {
    fragment
        .lines()
        .map(|line| line.trim().trim_end_matches(',').trim_end())
        .filter(|line| !line.is_empty())
}

/// Parse every complete record in `fragment`, skipping torn lines.
pub fn decode_fragment(fragment: &str) -> Vec<DecodedRecord> {
    fragment_lines(fragment)
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

/// Identity and routing data placed in the batch envelope.
#[derive(Clone, Copy, Debug)]
pub struct BatchContext<'a> {
    pub category: Category,
    pub app_key: &'a str,
    pub app_name: &'a str,
}

#[derive(Serialize)]
struct Envelope<'a> {
    category: &'static str,
    app_key: &'a str,
    app_name: &'a str,
    sent_at: String,
    logs: Vec<&'a RawValue>,
}

/// Wire document ready for upload.
#[derive(Clone, Debug)]
pub struct Batch {
    pub body: Vec<u8>,
    /// Number of records carried by the document.
    pub record_count: usize,
    /// Lines dropped because they were not complete JSON objects.
    pub skipped: usize,
}

/// Wrap an accumulated fragment in the outer envelope and serialize it.
///
/// Lines that do not parse as a JSON object, such as a record torn by an
/// abrupt termination, are skipped with a warning instead of failing the
/// whole batch.
pub fn assemble_batch(fragment: &str, context: BatchContext<'_>) -> Result<Batch, CodecError> {
    let mut logs = Vec::new();
    let mut skipped = 0;
    for line in fragment_lines(fragment) {
        match serde_json::from_str::<&RawValue>(line) {
            Ok(raw) if raw.get().starts_with('{') => logs.push(raw),
            Ok(_) | Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!(
            "femtotelemetry: skipped {skipped} unreadable {} records while assembling batch",
            context.category
        );
    }
    let record_count = logs.len();
    let envelope = Envelope {
        category: context.category.file_stem(),
        app_key: context.app_key,
        app_name: context.app_name,
        sent_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        logs,
    };
    Ok(Batch {
        body: serde_json::to_vec(&envelope)?,
        record_count,
        skipped,
    })
}
