//! Compatibility bridge for the Rust `log` crate.
//!
//! [`TelemetryLogAdapter`] implements `log::Log` and forwards host
//! application log records into the operational category. Records emitted by
//! this crate itself are skipped so engine diagnostics never feed back into
//! the write path. [`install_global_logger`] installs the adapter as the
//! process-wide logger.

use std::borrow::Cow;
use std::sync::Arc;

use log::{LevelFilter, Metadata, Record};
use once_cell::sync::OnceCell;
use thiserror::Error;

use crate::level::FemtoLevel;
use crate::record::EventRecord;
use crate::telemetry::FemtoTelemetry;

/// Target prefix of the engine's own diagnostics.
const INTERNAL_TARGET: &str = "femtotelemetry";

#[derive(Debug, Error)]
pub enum LogBridgeError {
    #[error("the telemetry log bridge is already installed")]
    AlreadyInstalled,
    #[error("another global logger is already set")]
    LoggerAlreadySet(#[from] log::SetLoggerError),
}

fn is_internal(target: &str) -> bool {
    target == INTERNAL_TARGET
        || target
            .strip_prefix(INTERNAL_TARGET)
            .is_some_and(|rest| rest.starts_with("::"))
}

fn normalise_target(target: &str) -> Cow<'_, str> {
    if target.contains("::") {
        Cow::Owned(target.replace("::", "."))
    } else {
        Cow::Borrowed(target)
    }
}

/// Adapter implementing the Rust `log::Log` trait.
pub struct TelemetryLogAdapter {
    telemetry: Arc<FemtoTelemetry>,
    max_level: LevelFilter,
}

impl TelemetryLogAdapter {
    pub fn new(telemetry: Arc<FemtoTelemetry>, max_level: LevelFilter) -> Self {
        Self {
            telemetry,
            max_level,
        }
    }
}

impl log::Log for TelemetryLogAdapter {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.max_level
            && !is_internal(metadata.target())
            && FemtoLevel::from(metadata.level()).passes(self.telemetry.min_level())
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut event = EventRecord::new(
            FemtoLevel::from(record.level()),
            normalise_target(record.target()),
            record.args().to_string(),
        );
        if let Some(module_path) = record.module_path() {
            event = event.with_field("module_path", module_path);
        }
        if let (Some(file), Some(line)) = (record.file(), record.line()) {
            event = event
                .with_field("file", file)
                .with_field("line", &line);
        }
        // Drops are already reported by the writer's rate-limited warning.
        let _ = self.telemetry.record(event);
    }

    fn flush(&self) {
        self.telemetry.flush();
    }
}

static ADAPTER: OnceCell<TelemetryLogAdapter> = OnceCell::new();

/// Install the bridge as the global Rust logger.
///
/// Fails if the bridge or any other logger has already been installed.
pub fn install_global_logger(
    telemetry: Arc<FemtoTelemetry>,
    max_level: LevelFilter,
) -> Result<(), LogBridgeError> {
    ADAPTER
        .set(TelemetryLogAdapter::new(telemetry, max_level))
        .map_err(|_| LogBridgeError::AlreadyInstalled)?;
    let adapter = ADAPTER.get().ok_or(LogBridgeError::AlreadyInstalled)?;
    log::set_logger(adapter)?;
    log::set_max_level(max_level);
    Ok(())
}
