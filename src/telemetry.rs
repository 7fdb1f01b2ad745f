//! The engine facade.
//!
//! [`FemtoTelemetry`] owns every long-lived service: one writer and one
//! delivery coordinator per category, the session tracker, the crash flag and
//! crash capture. Construct it once at startup and share it by reference or
//! `Arc`.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use delegate::delegate;
use log::warn;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    capture::{CrashCapture, CrashReport},
    config::{Identity, TelemetryConfig},
    delivery::{DeliveryCoordinator, SendDispatch, SendResult, Transport, UreqTransport},
    level::FemtoLevel,
    recorder::{MetadataEnricher, Recorder, RuntimeSettings},
    record::{Category, EventRecord, Metadata},
    session::{SessionSummary, SessionTracker},
    sink::{Durability, RecordSink, SubmitError},
    state::{CrashFlag, FileStateStore, StateStore},
    store::SharedCapacity,
    writer::{CategoryWriter, WriterError},
};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error(transparent)]
    Writer(#[from] WriterError),
    #[error("failed to initialise TLS for the collector transport: {0}")]
    Tls(#[from] native_tls::Error),
}

/// Host lifecycle notifications.
///
/// Platform glue calls these on foreground and background transitions; the
/// engine maps them onto session boundaries.
pub trait LifecycleObserver {
    fn on_foreground(&self);
    fn on_background(&self);
}

/// Optional collaborators replacing the engine's defaults.
#[derive(Clone, Default)]
pub struct Collaborators {
    /// Used instead of an HTTP transport built from the configuration.
    pub transport: Option<Arc<dyn Transport>>,
    /// Used instead of the state document in the storage directory.
    pub state_store: Option<Arc<dyn StateStore>>,
    pub enricher: Option<Arc<dyn MetadataEnricher>>,
}

pub struct FemtoTelemetry {
    storage_dir: PathBuf,
    capacity: SharedCapacity,
    settings: Arc<RuntimeSettings>,
    recorder: Arc<Recorder>,
    coordinators: [DeliveryCoordinator; 2],
    session: Arc<SessionTracker>,
    crash_flag: Arc<CrashFlag>,
    capture: Arc<CrashCapture>,
    #[cfg(all(unix, feature = "signals"))]
    signals: parking_lot::Mutex<Option<crate::capture::signals::SignalCapture>>,
}

impl FemtoTelemetry {
    /// Start the engine with default collaborators.
    pub fn open(config: TelemetryConfig) -> Result<Self, TelemetryError> {
        Self::open_with(config, Collaborators::default())
    }

    pub fn open_with(
        config: TelemetryConfig,
        collaborators: Collaborators,
    ) -> Result<Self, TelemetryError> {
        let Collaborators {
            transport,
            state_store,
            enricher,
        } = collaborators;
        let transport = match (transport, config.transport) {
            (Some(transport), _) => Some(transport),
            (None, Some(http)) => Some(Arc::new(UreqTransport::new(http)?) as Arc<dyn Transport>),
            (None, None) => None,
        };
        let capacity = SharedCapacity::new(config.max_storage_bytes);
        let open_writer = |category| {
            CategoryWriter::open(&config.storage_dir, category, capacity.clone(), config.writer)
                .map(Arc::new)
        };
        let writers = [
            open_writer(Category::Operational)?,
            open_writer(Category::Analytics)?,
        ];
        let state_store = state_store
            .unwrap_or_else(|| Arc::new(FileStateStore::open(&config.storage_dir)));
        let crash_flag = Arc::new(CrashFlag::new(state_store));
        let settings = Arc::new(RuntimeSettings::new(
            config.min_level,
            config.persistence_enabled,
        ));
        let coordinators = writers.clone().map(|writer| {
            DeliveryCoordinator::new(
                writer,
                config.identity.clone(),
                transport.clone(),
                Arc::clone(&crash_flag),
            )
        });
        let recorder = Arc::new(Recorder::new(writers, Arc::clone(&settings), enricher));
        let session = Arc::new(SessionTracker::new(
            Arc::clone(&recorder) as Arc<dyn RecordSink>,
            Arc::clone(&crash_flag),
            config.identity.as_ref().map(|id| id.app_name.clone()),
        ));
        let capture = Arc::new(CrashCapture::new(
            Arc::clone(&recorder) as Arc<dyn RecordSink>,
            Arc::clone(&session),
            Arc::clone(&crash_flag),
        ));
        Ok(Self {
            storage_dir: config.storage_dir,
            capacity,
            settings,
            recorder,
            coordinators,
            session,
            crash_flag,
            capture,
            #[cfg(all(unix, feature = "signals"))]
            signals: parking_lot::Mutex::new(None),
        })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Filter, enrich and queue a record for its category.
    ///
    /// Records below the minimum level or submitted while persistence is
    /// disabled are dropped and reported as accepted.
    pub fn record(&self, record: EventRecord) -> Result<(), SubmitError> {
        self.recorder.submit(record, Durability::Queued)
    }

    pub fn log(
        &self,
        level: FemtoLevel,
        source: &str,
        message: impl Into<String>,
    ) -> Result<(), SubmitError> {
        self.record(EventRecord::new(level, source, message))
    }

    /// Record an analytics event named `name`.
    pub fn track(&self, name: &str, metadata: Metadata) -> Result<(), SubmitError> {
        self.record(EventRecord::analytics(name).with_metadata(metadata))
    }

    delegate! {
        to self.session {
            /// Open a session; `None` if one is already open.
            #[call(start)]
            pub fn session_start(&self) -> Option<Uuid>;
            pub fn session_id(&self) -> Option<Uuid>;
        }
    }

    /// Close the open session, if any.
    pub fn session_end(&self) -> SessionSummary {
        self.session.end(Durability::Queued)
    }

    /// Start one upload attempt for `category`.
    ///
    /// See [`DeliveryCoordinator::send`] for the callback contract.
    pub fn send<F>(&self, category: Category, on_complete: F) -> SendDispatch
    where
        F: FnOnce(SendResult) + Send + 'static,
    {
        self.coordinator(category).send(on_complete)
    }

    pub fn coordinator(&self, category: Category) -> &DeliveryCoordinator {
        &self.coordinators[category.index()]
    }

    pub fn set_identity(&self, identity: Identity) {
        for coordinator in &self.coordinators {
            coordinator.set_identity(identity.clone());
        }
    }

    pub fn set_transport(&self, transport: Arc<dyn Transport>) {
        for coordinator in &self.coordinators {
            coordinator.set_transport(Arc::clone(&transport));
        }
    }

    /// Change the storage cap per category; zero is ignored.
    pub fn set_max_storage_bytes(&self, bytes: u64) {
        if bytes == 0 {
            warn!("femtotelemetry: ignoring max storage size of zero bytes");
            return;
        }
        self.capacity.set(bytes);
    }

    pub fn max_storage_bytes(&self) -> u64 {
        self.capacity.get()
    }

    delegate! {
        to self.settings {
            pub fn min_level(&self) -> FemtoLevel;
            /// Records below `level` are dropped before reaching a writer.
            pub fn set_min_level(&self, level: FemtoLevel);
            pub fn persistence_enabled(&self) -> bool;
            /// When disabled every record is dropped.
            pub fn set_persistence_enabled(&self, enabled: bool);
        }
    }

    /// Whether an uncaught failure was recorded and not yet delivered.
    pub fn crash_flag_raised(&self) -> bool {
        self.crash_flag.load()
    }

    /// Persist a terminal record and close the session.
    pub fn capture_crash(&self, report: CrashReport) -> bool {
        self.capture.capture(report)
    }

    /// Capture the first panic of the process.
    pub fn install_panic_hook(&self) {
        self.capture.install_panic_hook();
    }

    /// Capture the first termination signal of the process.
    #[cfg(all(unix, feature = "signals"))]
    pub fn install_signal_handlers(&self) -> std::io::Result<()> {
        let mut slot = self.signals.lock();
        if slot.is_none() {
            *slot = Some(self.capture.install_signal_handlers()?);
        }
        Ok(())
    }

    /// Wait until both categories have applied every queued record.
    pub fn flush(&self) -> bool {
        Category::ALL
            .iter()
            .map(|&category| self.recorder.writer(category).flush())
            .fold(true, |all, ok| all && ok)
    }

    /// Drain and stop both writers. Later records are rejected.
    pub fn close(&self) {
        #[cfg(all(unix, feature = "signals"))]
        self.signals.lock().take();
        for category in Category::ALL {
            self.recorder.writer(category).close();
        }
    }
}

impl LifecycleObserver for FemtoTelemetry {
    fn on_foreground(&self) {
        self.session_start();
    }

    fn on_background(&self) {
        self.session_end();
    }
}

impl std::fmt::Debug for FemtoTelemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FemtoTelemetry")
            .field("storage_dir", &self.storage_dir)
            .field("max_storage_bytes", &self.max_storage_bytes())
            .field("min_level", &self.min_level())
            .field("persistence_enabled", &self.persistence_enabled())
            .finish_non_exhaustive()
    }
}
