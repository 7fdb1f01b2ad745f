//! Session boundary tracking.
//!
//! A [`SessionTracker`] is either closed or holds exactly one open session.
//! Starting an open session is a no-op and ending a closed one emits
//! nothing, so lifecycle notifications can be forwarded without
//! deduplication by the host.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use chrono::Utc;
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    record::EventRecord,
    sink::{Durability, RecordSink},
    state::CrashFlag,
};

/// Event name of the record emitted when a session opens.
pub const SESSION_START_EVENT: &str = "session_start";
/// Event name of the record emitted when a session closes.
pub const SESSION_END_EVENT: &str = "session_end";
/// Event name of the one-time context record.
pub const APP_CONTEXT_EVENT: &str = "app_context";

/// How a session came to an end.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClosedBy {
    User,
    Crash,
}

/// Result of [`SessionTracker::end`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionSummary {
    /// Identifier of the closed session, `None` if none was open.
    pub session_id: Option<Uuid>,
    pub duration_ms: u64,
    pub closed_by: ClosedBy,
}

#[derive(Debug, Default)]
struct SessionState {
    session_id: Option<Uuid>,
    start_time_ms: i64,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub struct SessionTracker {
    state: Mutex<SessionState>,
    sink: Arc<dyn RecordSink>,
    crash_flag: Arc<CrashFlag>,
    app_name: Option<String>,
    context_sent: AtomicBool,
}

impl SessionTracker {
    pub fn new(
        sink: Arc<dyn RecordSink>,
        crash_flag: Arc<CrashFlag>,
        app_name: Option<String>,
    ) -> Self {
        Self {
            state: Mutex::new(SessionState::default()),
            sink,
            crash_flag,
            app_name,
            context_sent: AtomicBool::new(false),
        }
    }

    /// Open a session. Returns the new identifier, or `None` if a session
    /// was already open.
    pub fn start(&self) -> Option<Uuid> {
        let session_id = {
            let mut state = self.state.lock();
            if let Some(open) = state.session_id {
                info!("femtotelemetry: session {open} already open");
                return None;
            }
            let session_id = Uuid::new_v4();
            state.session_id = Some(session_id);
            state.start_time_ms = now_millis();
            let record = EventRecord::analytics(SESSION_START_EVENT)
                .with_field("session_id", &session_id)
                .with_field("start_time", &state.start_time_ms);
            self.emit(record, Durability::Queued);
            session_id
        };
        if !self.context_sent.swap(true, Ordering::AcqRel) {
            self.emit(self.context_record(), Durability::Queued);
        }
        Some(session_id)
    }

    /// Close the open session, if any, and reset to the closed state.
    pub fn end(&self, durability: Durability) -> SessionSummary {
        let closed_by = if self.crash_flag.fired_in_process() {
            ClosedBy::Crash
        } else {
            ClosedBy::User
        };
        let mut state = self.state.lock();
        let duration_ms = if state.session_id.is_some() && state.start_time_ms > 0 {
            u64::try_from(now_millis() - state.start_time_ms).unwrap_or(0)
        } else {
            0
        };
        let session_id = state.session_id.take();
        state.start_time_ms = 0;
        if let Some(id) = session_id {
            let record = EventRecord::analytics(SESSION_END_EVENT)
                .with_field("session_id", &id)
                .with_field("duration", &duration_ms)
                .with_field("closed_by", &closed_by);
            self.emit(record, durability);
        }
        SessionSummary {
            session_id,
            duration_ms,
            closed_by,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().session_id.is_some()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.state.lock().session_id
    }

    /// Start time of the open session in epoch milliseconds, `0` when closed.
    pub fn start_time_ms(&self) -> i64 {
        self.state.lock().start_time_ms
    }

    fn context_record(&self) -> EventRecord {
        let mut record = EventRecord::analytics(APP_CONTEXT_EVENT)
            .with_field("os", std::env::consts::OS)
            .with_field("arch", std::env::consts::ARCH)
            .with_field("pid", &std::process::id())
            .with_field("library_version", env!("CARGO_PKG_VERSION"));
        if let Some(name) = &self.app_name {
            record = record.with_field("app_name", name.as_str());
        }
        record
    }

    fn emit(&self, record: EventRecord, durability: Durability) {
        if let Err(err) = self.sink.submit(record, durability) {
            warn!("femtotelemetry: session record not written: {err}");
        }
    }
}

impl std::fmt::Debug for SessionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SessionTracker")
            .field("session_id", &state.session_id)
            .field("start_time_ms", &state.start_time_ms)
            .finish_non_exhaustive()
    }
}
