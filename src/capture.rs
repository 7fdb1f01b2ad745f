//! Terminal failure capture.
//!
//! [`CrashCapture`] persists one `fatal` record for the first panic or
//! termination signal of the process, closes the open session and then lets
//! the previous panic hook or the default signal disposition take over. The
//! record is written with [`Durability::Flushed`] so it is on disk before the
//! process goes away.

use std::{
    backtrace::Backtrace,
    panic::{self, PanicHookInfo},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use log::{error, warn};

use crate::{
    level::FemtoLevel,
    record::EventRecord,
    session::SessionTracker,
    sink::{Durability, RecordSink},
    state::CrashFlag,
    writer::on_writer_thread,
};

/// Source name of records describing a panic.
pub const PANIC_SOURCE: &str = "panic";
/// Source name of records describing a termination signal.
pub const SIGNAL_SOURCE: &str = "signal";

/// What brought the process down.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CrashCause {
    Panic {
        message: String,
        location: Option<String>,
    },
    Signal {
        number: i32,
        name: &'static str,
        description: &'static str,
    },
}

/// Description of a terminal failure.
#[derive(Clone, Debug)]
pub struct CrashReport {
    pub cause: CrashCause,
    pub thread: Option<String>,
    pub stack_trace: String,
}

impl CrashReport {
    pub fn panic(message: impl Into<String>, location: Option<String>) -> Self {
        Self::with_cause(CrashCause::Panic {
            message: message.into(),
            location,
        })
    }

    pub fn from_panic_info(info: &PanicHookInfo<'_>) -> Self {
        let location = info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()));
        Self::panic(panic_message(info), location)
    }

    #[cfg(all(unix, feature = "signals"))]
    pub fn signal(number: i32) -> Self {
        let (name, description) = signals::describe(number);
        Self::with_cause(CrashCause::Signal {
            number,
            name,
            description,
        })
    }

    fn with_cause(cause: CrashCause) -> Self {
        Self {
            cause,
            thread: thread::current().name().map(str::to_owned),
            stack_trace: Backtrace::force_capture().to_string(),
        }
    }

    fn into_record(self) -> EventRecord {
        let (source, message, record) = match self.cause {
            CrashCause::Panic { message, location } => {
                let mut record = EventRecord::new(FemtoLevel::Fatal, PANIC_SOURCE, &message)
                    .with_field("exception_type", "panic")
                    .with_field("reason", &message);
                if let Some(location) = location {
                    record = record.with_field("location", &location);
                }
                (PANIC_SOURCE, message, record)
            }
            CrashCause::Signal {
                number,
                name,
                description,
            } => {
                let message = format!("received {name}");
                let record = EventRecord::new(FemtoLevel::Fatal, SIGNAL_SOURCE, &message)
                    .with_field("signal", name)
                    .with_field("signal_number", &number)
                    .with_field("reason", description);
                (SIGNAL_SOURCE, message, record)
            }
        };
        error!("femtotelemetry: capturing terminal {source} event: {message}");
        let mut record = record.with_field("stack_trace", &self.stack_trace);
        if let Some(thread) = self.thread {
            record = record.with_field("thread", &thread);
        }
        record
    }
}

fn panic_message(info: &PanicHookInfo<'_>) -> String {
    if let Some(message) = info.payload().downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = info.payload().downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// One-shot terminal event writer.
pub struct CrashCapture {
    sink: Arc<dyn RecordSink>,
    session: Arc<SessionTracker>,
    crash_flag: Arc<CrashFlag>,
    fired: AtomicBool,
    hook_installed: AtomicBool,
}

impl CrashCapture {
    pub fn new(
        sink: Arc<dyn RecordSink>,
        session: Arc<SessionTracker>,
        crash_flag: Arc<CrashFlag>,
    ) -> Self {
        Self {
            sink,
            session,
            crash_flag,
            fired: AtomicBool::new(false),
            hook_installed: AtomicBool::new(false),
        }
    }

    /// Whether a terminal event has already been captured.
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Persist the terminal record and close the session.
    ///
    /// Only the first call does anything; later calls return `false`. On a
    /// writer thread the record is queued instead of awaited, as that thread
    /// would otherwise wait on itself.
    pub fn capture(&self, report: CrashReport) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.crash_flag.mark();
        let durability = if on_writer_thread() {
            Durability::Queued
        } else {
            Durability::Flushed
        };
        if let Err(err) = self.sink.submit(report.into_record(), durability) {
            warn!("femtotelemetry: terminal record not written: {err}");
        }
        self.session.end(durability);
        true
    }

    /// Chain a panic hook that captures the first panic.
    ///
    /// The hook keeps only a weak reference, so dropping the capture turns it
    /// into a pass-through to the previous hook. Installing twice is a no-op.
    pub fn install_panic_hook(self: &Arc<Self>) {
        if self.hook_installed.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if let Some(capture) = weak.upgrade() {
                capture.capture(CrashReport::from_panic_info(info));
            }
            previous(info);
        }));
    }

    /// Observe termination signals on a background thread.
    #[cfg(all(unix, feature = "signals"))]
    pub fn install_signal_handlers(self: &Arc<Self>) -> std::io::Result<signals::SignalCapture> {
        signals::SignalCapture::install(Arc::downgrade(self))
    }
}

impl std::fmt::Debug for CrashCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrashCapture")
            .field("fired", &self.has_fired())
            .finish_non_exhaustive()
    }
}

#[cfg(all(unix, feature = "signals"))]
pub mod signals {
    //! Termination signal capture backed by `signal-hook`.

    use std::{io, sync::Weak, thread};

    use log::warn;
    use signal_hook::{
        consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM},
        iterator::{Handle, Signals},
        low_level,
    };

    use super::{CrashCapture, CrashReport};

    /// Signals that end the process and are worth a terminal record.
    pub const TERMINATION_SIGNALS: [i32; 4] = [SIGTERM, SIGINT, SIGHUP, SIGQUIT];

    const SIGNAL_TABLE: [(i32, &str, &str); 4] = [
        (SIGTERM, "SIGTERM", "termination requested"),
        (SIGINT, "SIGINT", "interrupted from keyboard"),
        (SIGHUP, "SIGHUP", "hangup on controlling terminal"),
        (SIGQUIT, "SIGQUIT", "quit from keyboard"),
    ];

    pub(super) fn describe(number: i32) -> (&'static str, &'static str) {
        SIGNAL_TABLE
            .iter()
            .find(|(n, _, _)| *n == number)
            .map(|(_, name, description)| (*name, *description))
            .unwrap_or(("UNKNOWN", "unrecognised signal"))
    }

    /// Running signal listener; dropping it stops listening.
    pub struct SignalCapture {
        handle: Handle,
        thread: Option<thread::JoinHandle<()>>,
    }

    impl SignalCapture {
        pub(super) fn install(capture: Weak<CrashCapture>) -> io::Result<Self> {
            let mut signals = Signals::new(TERMINATION_SIGNALS)?;
            let handle = signals.handle();
            let thread = thread::Builder::new()
                .name("femtotelemetry-signals".into())
                .spawn(move || {
                    if let Some(signal) = signals.forever().next() {
                        if let Some(capture) = capture.upgrade() {
                            capture.capture(CrashReport::signal(signal));
                        }
                        if let Err(err) = low_level::emulate_default_handler(signal) {
                            warn!("femtotelemetry: failed to re-raise signal {signal}: {err}");
                        }
                    }
                })?;
            Ok(Self {
                handle,
                thread: Some(thread),
            })
        }
    }

    impl Drop for SignalCapture {
        fn drop(&mut self) {
            self.handle.close();
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }

}
