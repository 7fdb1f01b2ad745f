//! Batched upload of a category's accumulated records.
//!
//! A [`DeliveryCoordinator`] performs single-attempt sends with at most one
//! attempt in flight per category. Every file operation of an attempt runs
//! as a task on the category's writer thread, so preparing and discarding the
//! outbound buffer is serialised with ordinary appends. The transport call
//! itself happens on a short-lived background thread and its completion is
//! routed back to the writer before the caller hears about it.

pub mod transport;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use crossbeam_channel::bounded;
use log::{debug, warn};
use parking_lot::RwLock;
use thiserror::Error;

use crate::{
    codec::{Batch, BatchContext, assemble_batch},
    config::Identity,
    record::Category,
    state::CrashFlag,
    store::CategoryStore,
    writer::CategoryWriter,
};

pub use transport::{
    HttpTransportConfig, STATUS_CREATED, Transport, TransportResponse, UploadCallback,
    UploadRequest, UreqTransport,
};

/// Name prefix of the background threads driving uploads.
pub const SEND_THREAD_PREFIX: &str = "femtotelemetry-send-";

/// Outcome of a send attempt reported to the caller's callback.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Nothing durable was waiting; not worth retrying until new records arrive.
    #[error("no data to send")]
    NoDataToSend,
    /// Identity or transport have not been configured.
    #[error("telemetry identity or transport not configured")]
    NotInitialized,
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("failed to assemble batch: {0}")]
    Assemble(String),
    #[error("category writer is closed")]
    WriterClosed,
    /// The attempt ended without the transport reporting an outcome.
    #[error("send attempt was interrupted")]
    Interrupted,
    /// The batch was not accepted; the outbound buffer is kept for retry.
    #[error("upload failed (status {status:?}): {}", failure_detail(.error, .body))]
    TransportFailure {
        status: Option<u16>,
        body: Option<String>,
        error: Option<String>,
    },
}

fn failure_detail<'a>(error: &'a Option<String>, body: &'a Option<String>) -> &'a str {
    error
        .as_deref()
        .or(body.as_deref())
        .unwrap_or("no detail")
}

/// Details of an accepted batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendReceipt {
    pub category: Category,
    pub status: u16,
    pub record_count: usize,
    pub bytes: usize,
}

pub type SendResult = Result<SendReceipt, DeliveryError>;
pub type SendCallback = Box<dyn FnOnce(SendResult) + Send>;

/// Whether [`DeliveryCoordinator::send`] started an attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendDispatch {
    /// The callback will be invoked exactly once.
    Started,
    /// Another attempt is outstanding; the request was dropped and its
    /// callback will never be invoked.
    AlreadyInFlight,
}

/// Owns the in-flight guard for one attempt.
///
/// Completing clears the guard before the caller's callback runs. If the
/// attempt is abandoned, for example because the transport dropped its
/// callback, dropping this value clears the guard and reports
/// [`DeliveryError::Interrupted`].
struct PendingSend {
    guard: Arc<AtomicBool>,
    on_complete: Option<SendCallback>,
}

impl PendingSend {
    fn complete(mut self, result: SendResult) {
        self.finish(result);
    }

    fn finish(&mut self, result: SendResult) {
        if let Some(callback) = self.on_complete.take() {
            self.guard.store(false, Ordering::Release);
            callback(result);
        }
    }
}

impl Drop for PendingSend {
    fn drop(&mut self) {
        self.finish(Err(DeliveryError::Interrupted));
    }
}

pub struct DeliveryCoordinator {
    category: Category,
    writer: Arc<CategoryWriter>,
    identity: RwLock<Option<Identity>>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    crash_flag: Arc<CrashFlag>,
    in_flight: Arc<AtomicBool>,
}

impl DeliveryCoordinator {
    pub fn new(
        writer: Arc<CategoryWriter>,
        identity: Option<Identity>,
        transport: Option<Arc<dyn Transport>>,
        crash_flag: Arc<CrashFlag>,
    ) -> Self {
        Self {
            category: writer.category(),
            writer,
            identity: RwLock::new(identity),
            transport: RwLock::new(transport),
            crash_flag,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn set_identity(&self, identity: Identity) {
        *self.identity.write() = Some(identity);
    }

    pub fn set_transport(&self, transport: Arc<dyn Transport>) {
        *self.transport.write() = Some(transport);
    }

    /// Whether an attempt is outstanding.
    pub fn in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Start one upload attempt of everything accumulated so far.
    ///
    /// `on_complete` runs on an unspecified thread once the attempt has
    /// finished. A request made while another attempt is outstanding is
    /// dropped without invoking its callback.
    pub fn send<F>(&self, on_complete: F) -> SendDispatch
    where
        F: FnOnce(SendResult) + Send + 'static,
    {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(
                "femtotelemetry: {} send already in flight; request ignored",
                self.category
            );
            return SendDispatch::AlreadyInFlight;
        }
        let pending = PendingSend {
            guard: Arc::clone(&self.in_flight),
            on_complete: Some(Box::new(on_complete)),
        };
        let (identity, transport) = match (
            self.identity.read().clone(),
            self.transport.read().clone(),
        ) {
            (Some(identity), Some(transport)) => (identity, transport),
            _ => {
                pending.complete(Err(DeliveryError::NotInitialized));
                return SendDispatch::Started;
            }
        };
        let attempt = Attempt {
            category: self.category,
            writer: Arc::clone(&self.writer),
            identity,
            transport,
            crash_flag: Arc::clone(&self.crash_flag),
        };
        let spawned = thread::Builder::new()
            .name(format!("{SEND_THREAD_PREFIX}{}", self.category))
            .spawn(move || attempt.run(pending));
        if let Err(err) = spawned {
            // The closure, and with it the pending send, was dropped.
            warn!("femtotelemetry: failed to spawn send thread: {err}");
        }
        SendDispatch::Started
    }
}

impl std::fmt::Debug for DeliveryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryCoordinator")
            .field("category", &self.category)
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

struct Attempt {
    category: Category,
    writer: Arc<CategoryWriter>,
    identity: Identity,
    transport: Arc<dyn Transport>,
    crash_flag: Arc<CrashFlag>,
}

impl Attempt {
    fn run(self, pending: PendingSend) {
        let batch = match self.prepare() {
            Ok(batch) => batch,
            Err(err) => {
                pending.complete(Err(err));
                return;
            }
        };
        let request = UploadRequest {
            category: self.category,
            body: batch.body,
            headers: vec![("Content-Type".to_owned(), "application/json".to_owned())],
        };
        let bytes = request.body.len();
        let record_count = batch.record_count;
        let Attempt {
            category,
            writer,
            transport,
            crash_flag,
            ..
        } = self;
        transport.upload(
            request,
            Box::new(move |response| {
                if !response.is_created() {
                    warn!(
                        "femtotelemetry: {category} upload not accepted (status {:?}); keeping buffer",
                        response.status
                    );
                    pending.complete(Err(DeliveryError::TransportFailure {
                        status: response.status,
                        body: response.body,
                        error: response.error,
                    }));
                    return;
                }
                let receipt = SendReceipt {
                    category,
                    status: STATUS_CREATED,
                    record_count,
                    bytes,
                };
                // Dropped with the task if the writer has closed.
                let _ = writer.execute(move |store| {
                    acknowledge(store, &crash_flag);
                    pending.complete(Ok(receipt));
                });
            }),
        );
    }

    /// Move accumulated records into the outbound buffer and build the batch
    /// on the writer thread.
    fn prepare(&self) -> Result<Batch, DeliveryError> {
        let (tx, rx) = bounded(1);
        let identity = self.identity.clone();
        self.writer
            .execute(move |store| {
                let _ = tx.send(prepare_batch(store, &identity));
            })
            .map_err(|_| DeliveryError::WriterClosed)?;
        rx.recv().map_err(|_| DeliveryError::WriterClosed)?
    }
}

fn prepare_batch(store: &mut CategoryStore, identity: &Identity) -> Result<Batch, DeliveryError> {
    let category = store.category();
    let fragment = store
        .prepare_for_send()
        .map_err(|err| {
            warn!("femtotelemetry: {err}");
            DeliveryError::StorageUnavailable(err.to_string())
        })?
        .ok_or(DeliveryError::NoDataToSend)?;
    let batch = assemble_batch(
        &fragment,
        BatchContext {
            category,
            app_key: &identity.app_key,
            app_name: &identity.app_name,
        },
    )
    .map_err(|err| DeliveryError::Assemble(err.to_string()))?;
    if batch.record_count == 0 {
        // Only torn or blank lines; nothing worth uploading or keeping.
        if let Err(err) = store.discard_sent() {
            warn!("femtotelemetry: {err}");
        }
        return Err(DeliveryError::NoDataToSend);
    }
    Ok(batch)
}

fn acknowledge(store: &mut CategoryStore, crash_flag: &CrashFlag) {
    if let Err(err) = store.discard_sent() {
        warn!("femtotelemetry: {err}; batch may be sent again");
    }
    if store.category() == Category::Operational {
        if let Err(err) = crash_flag.clear() {
            warn!("femtotelemetry: failed to clear crash flag: {err}");
        }
    }
}
