//! Engine fixtures for integration tests.
//!
//! Each [`Engine`] runs against its own temporary directory with an in-memory
//! state store and a [`RecordingTransport`], so tests can inspect both the
//! files on disk and the uploads that reached the collector.

use std::{fs, path::Path, sync::Arc};

use femtotelemetry::{
    Category, Collaborators, FemtoTelemetry, Identity, MemoryStateStore, TelemetryConfig,
    TelemetryConfigBuilder,
    codec::{DecodedRecord, decode_fragment},
    store::StorePaths,
    test_utils::RecordingTransport,
};
use rstest::fixture;
use tempfile::TempDir;

pub struct Engine {
    pub dir: TempDir,
    pub telemetry: FemtoTelemetry,
    pub transport: RecordingTransport,
}

impl Engine {
    /// Start an engine after letting `configure` adjust the defaults.
    pub fn with_config(
        transport: RecordingTransport,
        configure: impl FnOnce(TelemetryConfigBuilder) -> TelemetryConfigBuilder,
    ) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let builder = TelemetryConfig::builder(dir.path())
            .with_identity(Identity::new("app-key", "integration"));
        let config = configure(builder).build().expect("config");
        let telemetry = FemtoTelemetry::open_with(
            config,
            Collaborators {
                transport: Some(Arc::new(transport.clone())),
                state_store: Some(Arc::new(MemoryStateStore::new())),
                enricher: None,
            },
        )
        .expect("engine");
        Self {
            dir,
            telemetry,
            transport,
        }
    }

    pub fn paths(&self, category: Category) -> StorePaths {
        StorePaths::new(self.dir.path(), category)
    }
}

/// An engine whose transport accepts every upload.
#[fixture]
pub fn engine() -> Engine {
    let transport = RecordingTransport::replying(
        std::iter::repeat_with(femtotelemetry::TransportResponse::created).take(16),
    );
    Engine::with_config(transport, |builder| builder)
}

/// Decode a fragment file, treating a missing file as empty.
pub fn read_fragment(path: &Path) -> Vec<DecodedRecord> {
    fs::read_to_string(path)
        .map(|text| decode_fragment(&text))
        .unwrap_or_default()
}
