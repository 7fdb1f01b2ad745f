//! Front door of the write path.
//!
//! [`Recorder`] applies the runtime settings (persistence switch and minimum
//! level), lets an optional [`MetadataEnricher`] decorate the record and
//! routes it to the writer of its category.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU8, Ordering},
};

use crate::{
    level::FemtoLevel,
    record::{Category, EventRecord, Metadata},
    sink::{Durability, RecordSink, SubmitError},
    writer::CategoryWriter,
};

/// Adds metadata to every record before it is queued.
///
/// Typical implementations attach location or device details. Enrichers run
/// on the submitting thread and must not call back into the engine.
pub trait MetadataEnricher: Send + Sync {
    fn enrich(&self, record: &EventRecord, metadata: &mut Metadata);
}

impl<F> MetadataEnricher for F
where
    F: Fn(&EventRecord, &mut Metadata) + Send + Sync,
{
    fn enrich(&self, record: &EventRecord, metadata: &mut Metadata) {
        self(record, metadata)
    }
}

/// Settings adjustable while the engine runs.
#[derive(Debug)]
pub(crate) struct RuntimeSettings {
    min_level: AtomicU8,
    persistence_enabled: AtomicBool,
}

impl RuntimeSettings {
    pub(crate) fn new(min_level: FemtoLevel, persistence_enabled: bool) -> Self {
        Self {
            min_level: AtomicU8::new(min_level as u8),
            persistence_enabled: AtomicBool::new(persistence_enabled),
        }
    }

    pub(crate) fn min_level(&self) -> FemtoLevel {
        FemtoLevel::from_u8(self.min_level.load(Ordering::Relaxed))
    }

    pub(crate) fn set_min_level(&self, level: FemtoLevel) {
        self.min_level.store(level as u8, Ordering::Relaxed);
    }

    pub(crate) fn persistence_enabled(&self) -> bool {
        self.persistence_enabled.load(Ordering::Relaxed)
    }

    pub(crate) fn set_persistence_enabled(&self, enabled: bool) {
        self.persistence_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Whether a record at `level` should reach a writer.
    pub(crate) fn accepts(&self, level: FemtoLevel) -> bool {
        self.persistence_enabled() && level.passes(self.min_level())
    }
}

pub(crate) struct Recorder {
    writers: [Arc<CategoryWriter>; 2],
    settings: Arc<RuntimeSettings>,
    enricher: Option<Arc<dyn MetadataEnricher>>,
}

impl Recorder {
    pub(crate) fn new(
        writers: [Arc<CategoryWriter>; 2],
        settings: Arc<RuntimeSettings>,
        enricher: Option<Arc<dyn MetadataEnricher>>,
    ) -> Self {
        Self {
            writers,
            settings,
            enricher,
        }
    }

    pub(crate) fn writer(&self, category: Category) -> &Arc<CategoryWriter> {
        &self.writers[category.index()]
    }
}

impl RecordSink for Recorder {
    /// Filtered records and records submitted while persistence is disabled
    /// are dropped silently and reported as accepted.
    fn submit(&self, mut record: EventRecord, durability: Durability) -> Result<(), SubmitError> {
        if !self.settings.accepts(record.level()) {
            return Ok(());
        }
        if let Some(enricher) = &self.enricher {
            let mut extra = Metadata::new();
            enricher.enrich(&record, &mut extra);
            if !extra.is_empty() || extra.rejected().is_some() {
                record = record.with_metadata(extra);
            }
        }
        self.writer(record.category()).submit(record, durability)
    }
}
