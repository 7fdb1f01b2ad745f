//! Telemetry record representation.
//!
//! An [`EventRecord`] captures one structured event together with its
//! timestamp, severity, emitting source, free-text message and optional
//! metadata. Records are immutable once handed to the engine; the builder
//! methods consume `self` so callers assemble a record before submitting it.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::level::FemtoLevel;

/// Independent stream of telemetry with its own files, queue and send cadence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    /// Operational log output.
    Operational,
    /// Analytics events, including session markers.
    Analytics,
}

impl Category {
    /// Every category, in a stable order.
    pub const ALL: [Category; 2] = [Category::Operational, Category::Analytics];

    /// File stem used for the category's files on disk.
    pub const fn file_stem(self) -> &'static str {
        match self {
            Self::Operational => "operational",
            Self::Analytics => "analytics",
        }
    }

    /// Category a record at `level` is routed to.
    pub fn for_level(level: FemtoLevel) -> Self {
        match level {
            FemtoLevel::Analytics => Self::Analytics,
            _ => Self::Operational,
        }
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            Self::Operational => 0,
            Self::Analytics => 1,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_stem())
    }
}

/// Metadata entry that could not be converted to JSON.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectedEntry {
    pub key: String,
    pub reason: String,
}

/// String-keyed metadata attached to a record.
///
/// Values are converted to JSON when inserted. A value whose `Serialize`
/// implementation fails is remembered as a [`RejectedEntry`]; the codec then
/// refuses to encode the record rather than writing a partial document.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Metadata {
    entries: BTreeMap<String, Value>,
    rejected: Option<RejectedEntry>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value` under `key`, replacing any previous entry.
    pub fn insert<T>(&mut self, key: impl Into<String>, value: &T)
    where
        T: Serialize + ?Sized,
    {
        let key = key.into();
        match serde_json::to_value(value) {
            Ok(json) => {
                self.entries.insert(key, json);
            }
            Err(err) => {
                if self.rejected.is_none() {
                    self.rejected = Some(RejectedEntry {
                        key,
                        reason: err.to_string(),
                    });
                }
            }
        }
    }

    /// Insert an already-converted JSON value.
    pub fn insert_value(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &BTreeMap<String, Value> {
        &self.entries
    }

    /// The first entry that failed conversion, if any.
    pub fn rejected(&self) -> Option<&RejectedEntry> {
        self.rejected.as_ref()
    }

    /// Merge `other` into `self`; entries in `other` win.
    pub fn extend(&mut self, other: Metadata) {
        self.entries.extend(other.entries);
        if self.rejected.is_none() {
            self.rejected = other.rejected;
        }
    }
}

impl From<BTreeMap<String, Value>> for Metadata {
    fn from(entries: BTreeMap<String, Value>) -> Self {
        Self {
            entries,
            rejected: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EventRecord {
    timestamp: DateTime<Utc>,
    level: FemtoLevel,
    source: String,
    message: String,
    metadata: Option<Metadata>,
}

impl EventRecord {
    /// Construct a record stamped with the current time.
    pub fn new(level: FemtoLevel, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            source: source.into(),
            message: message.into(),
            metadata: None,
        }
    }

    /// Construct an analytics record named `event` with an empty message.
    pub fn analytics(event: impl Into<String>) -> Self {
        Self::new(FemtoLevel::Analytics, event, String::new())
    }

    /// Attach one metadata entry.
    pub fn with_field<T>(mut self, key: impl Into<String>, value: &T) -> Self
    where
        T: Serialize + ?Sized,
    {
        self.metadata_mut().insert(key, value);
        self
    }

    /// Attach a metadata map, merging with any existing entries.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata_mut().extend(metadata);
        self
    }

    /// Override the capture time.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn level(&self) -> FemtoLevel {
        self.level
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    /// Metadata for in-place enrichment, created on first use.
    pub fn metadata_mut(&mut self) -> &mut Metadata {
        self.metadata.get_or_insert_with(Metadata::new)
    }

    /// Category this record is routed to.
    pub fn category(&self) -> Category {
        Category::for_level(self.level)
    }
}

impl fmt::Display for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.source, self.level, self.message)
    }
}
