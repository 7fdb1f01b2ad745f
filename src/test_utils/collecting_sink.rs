//! A sink that accumulates records in memory for test assertions.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::record::EventRecord;
use crate::sink::{Durability, RecordSink, SubmitError};

/// Sink that stores every record it receives for later inspection.
#[derive(Clone, Default)]
pub struct CollectingSink {
    records: Arc<Mutex<Vec<(EventRecord, Durability)>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records received so far.
    pub fn collected(&self) -> Vec<EventRecord> {
        self.records.lock().iter().map(|(r, _)| r.clone()).collect()
    }

    /// Durability requested for each record, in submission order.
    pub fn durabilities(&self) -> Vec<Durability> {
        self.records.lock().iter().map(|(_, d)| *d).collect()
    }
}

impl RecordSink for CollectingSink {
    fn submit(&self, record: EventRecord, durability: Durability) -> Result<(), SubmitError> {
        self.records.lock().push((record, durability));
        Ok(())
    }
}
