use std::time::Duration;

use thiserror::Error;

use crate::record::EventRecord;

/// How long a submitter is prepared to wait for its record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Durability {
    /// Queue the record and return; ordering is preserved, timing is not.
    #[default]
    Queued,
    /// Block until the record has been written and synced to disk.
    Flushed,
}

/// Errors returned when a record cannot be handed to a category worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("write queue is full")]
    QueueFull,
    #[error("writer has been closed")]
    Closed,
    #[error("timed out after {0:?} waiting for the write queue")]
    Timeout(Duration),
    /// The worker processed the record but could not persist it.
    #[error("record could not be persisted")]
    NotPersisted,
}

/// Destination for telemetry records.
///
/// Implementations are shared across threads and must preserve submission
/// order for records of the same category.
pub trait RecordSink: Send + Sync {
    /// Submit a record with the requested durability.
    fn submit(&self, record: EventRecord, durability: Durability) -> Result<(), SubmitError>;
}
