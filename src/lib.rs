//! Durable client-side telemetry spooling.
//!
//! Records are appended to a per-category ring of files by a dedicated
//! writer thread, rotated to bound disk usage, and uploaded on demand as one
//! batch with at most one upload in flight per category. Start with
//! [`FemtoTelemetry::open`].

pub mod capture;
pub mod codec;
pub mod config;
pub mod delivery;
pub mod level;
#[cfg(feature = "log-compat")]
pub mod log_compat;
pub mod rate_limited_warner;
pub mod record;
mod recorder;
pub mod session;
pub mod sink;
pub mod state;
pub mod store;
pub mod telemetry;
#[cfg(any(test, feature = "test-util"))]
pub mod test_utils;
pub mod writer;

pub use capture::{CrashCapture, CrashCause, CrashReport};
pub use config::{ConfigError, Identity, TelemetryConfig, TelemetryConfigBuilder};
pub use delivery::{
    DeliveryCoordinator, DeliveryError, HttpTransportConfig, SendDispatch, SendReceipt,
    SendResult, Transport, TransportResponse, UploadCallback, UploadRequest, UreqTransport,
};
pub use level::FemtoLevel;
#[cfg(feature = "log-compat")]
pub use log_compat::{LogBridgeError, TelemetryLogAdapter, install_global_logger};
pub use record::{Category, EventRecord, Metadata};
pub use recorder::MetadataEnricher;
pub use session::{ClosedBy, SessionSummary, SessionTracker};
pub use sink::{Durability, RecordSink, SubmitError};
pub use state::{CrashFlag, FileStateStore, MemoryStateStore, StateError, StateStore};
pub use telemetry::{Collaborators, FemtoTelemetry, LifecycleObserver, TelemetryError};
pub use writer::{CategoryWriter, OverflowPolicy, WriterConfig};
