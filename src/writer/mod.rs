//! Per-category write serializer.
//!
//! [`CategoryWriter`] spawns a dedicated worker thread that owns the
//! category's [`CategoryStore`]. Producers on any thread submit records over a
//! bounded channel; the worker encodes and appends them strictly in FIFO
//! order. The delivery coordinator reuses the same channel to run buffer
//! preparation and acknowledgement handling on the worker, so every file
//! operation of a category is serialised without explicit locks.
//!
//! Construct a writer with [`CategoryWriter::open`]. Dropping the writer
//! drains the queue and joins the worker.

mod config;
mod worker;

use std::{
    path::Path,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam_channel::{SendTimeoutError, Sender, TrySendError, bounded};
use log::warn;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::{
    rate_limited_warner::RateLimitedWarner,
    record::{Category, EventRecord},
    sink::{Durability, RecordSink, SubmitError},
    store::{CategoryStore, SharedCapacity, StoreError},
};

pub use config::{
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_FLUSH_TIMEOUT, OverflowPolicy, PolicyParseError,
    WriterConfig,
};
pub(crate) use worker::on_writer_thread;
use worker::{SerialTask, WorkerConfig, WorkerParts, WriterCommand, spawn_worker};

/// Errors raised while constructing a writer.
#[derive(Debug, Error)]
pub enum WriterError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to spawn writer thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("capacity must be greater than zero")]
    ZeroCapacity,
}

pub struct CategoryWriter {
    category: Category,
    tx: RwLock<Option<Sender<WriterCommand>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    done_rx: crossbeam_channel::Receiver<()>,
    overflow_policy: OverflowPolicy,
    flush_timeout: Duration,
    warner: RateLimitedWarner,
}

impl CategoryWriter {
    /// Open the category's store under `dir` and start its worker.
    pub fn open(
        dir: &Path,
        category: Category,
        capacity: SharedCapacity,
        config: WriterConfig,
    ) -> Result<Self, WriterError> {
        Self::open_with_barrier(dir, category, capacity, config, None)
    }

    pub(crate) fn open_with_barrier(
        dir: &Path,
        category: Category,
        capacity: SharedCapacity,
        config: WriterConfig,
        start_barrier: Option<std::sync::Arc<std::sync::Barrier>>,
    ) -> Result<Self, WriterError> {
        if config.capacity == 0 {
            return Err(WriterError::ZeroCapacity);
        }
        let store = CategoryStore::open(dir, category, capacity)?;
        let WorkerParts {
            tx,
            done_rx,
            handle,
        } = spawn_worker(
            store,
            WorkerConfig {
                capacity: config.capacity,
                start_barrier,
            },
        )?;
        Ok(Self {
            category,
            tx: RwLock::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            done_rx,
            overflow_policy: config.overflow_policy,
            flush_timeout: config.flush_timeout,
            warner: RateLimitedWarner::new(config.warn_interval),
        })
    }

    pub fn category(&self) -> Category {
        self.category
    }

    fn sender(&self) -> Option<Sender<WriterCommand>> {
        self.tx.read().as_ref().cloned()
    }

    /// Queue a record according to the configured overflow policy.
    pub fn append(&self, record: EventRecord) -> Result<(), SubmitError> {
        let Some(tx) = self.sender() else {
            self.note_drop("writer closed");
            return Err(SubmitError::Closed);
        };
        let cmd = WriterCommand::Record(Box::new(record));
        let result = match self.overflow_policy {
            OverflowPolicy::Drop => tx.try_send(cmd).map_err(|err| match err {
                TrySendError::Full(_) => SubmitError::QueueFull,
                TrySendError::Disconnected(_) => SubmitError::Closed,
            }),
            OverflowPolicy::Block => tx.send(cmd).map_err(|_| SubmitError::Closed),
            OverflowPolicy::Timeout(dur) => tx.send_timeout(cmd, dur).map_err(|err| match err {
                SendTimeoutError::Timeout(_) => SubmitError::Timeout(dur),
                SendTimeoutError::Disconnected(_) => SubmitError::Closed,
            }),
        };
        if let Err(err) = result {
            self.note_drop(&err.to_string());
        }
        result
    }

    /// Queue a record and block until it has been written and synced.
    ///
    /// There is deliberately no timeout: this path serves crash capture,
    /// where the process terminates right after the write regardless.
    pub fn append_durable(&self, record: EventRecord) -> Result<(), SubmitError> {
        let Some(tx) = self.sender() else {
            return Err(SubmitError::Closed);
        };
        let (ack_tx, ack_rx) = bounded(1);
        tx.send(WriterCommand::Durable(Box::new(record), ack_tx))
            .map_err(|_| SubmitError::Closed)?;
        match ack_rx.recv() {
            Ok(true) => Ok(()),
            Ok(false) => Err(SubmitError::NotPersisted),
            Err(_) => Err(SubmitError::Closed),
        }
    }

    /// Run `task` on the worker with exclusive access to the store.
    ///
    /// Tasks bypass the overflow policy and always wait for queue space so
    /// delivery bookkeeping is never dropped. On failure the task is dropped
    /// without running.
    pub(crate) fn execute<F>(&self, task: F) -> Result<(), SubmitError>
    where
        F: FnOnce(&mut CategoryStore) + Send + 'static,
    {
        let Some(tx) = self.sender() else {
            return Err(SubmitError::Closed);
        };
        let task: SerialTask = Box::new(task);
        tx.send(WriterCommand::Task(task))
            .map_err(|_| SubmitError::Closed)
    }

    /// Wait until every previously queued command has been applied.
    ///
    /// Returns `false` when the writer is closed or the worker does not
    /// acknowledge within the flush timeout.
    pub fn flush(&self) -> bool {
        self.warner.flush(|count| {
            warn!(
                "femtotelemetry: dropped {count} {} records in the last interval",
                self.category
            );
        });
        let Some(tx) = self.sender() else {
            return false;
        };
        let deadline = Instant::now() + self.flush_timeout;
        let (ack_tx, ack_rx) = bounded(1);
        if tx
            .send_timeout(WriterCommand::Flush(ack_tx), self.flush_timeout)
            .is_err()
        {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        ack_rx.recv_timeout(remaining).is_ok()
    }

    /// Close the queue, let the worker drain it and join the thread.
    ///
    /// Idempotent; only the first call performs shutdown work.
    pub fn close(&self) {
        self.tx.write().take();
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        if self.done_rx.recv_timeout(self.flush_timeout).is_err() {
            warn!(
                "femtotelemetry: {} writer did not shut down within {:?}",
                self.category, self.flush_timeout
            );
            return;
        }
        if handle.join().is_err() {
            warn!("femtotelemetry: {} writer thread panicked", self.category);
        }
    }

    fn note_drop(&self, reason: &str) {
        self.warner.record_drop();
        self.warner.warn_if_due(|count| {
            warn!(
                "femtotelemetry: {} queue rejected records ({reason}); dropped {count}",
                self.category
            );
        });
    }
}

impl RecordSink for CategoryWriter {
    fn submit(&self, record: EventRecord, durability: Durability) -> Result<(), SubmitError> {
        match durability {
            Durability::Queued => self.append(record),
            Durability::Flushed => self.append_durable(record),
        }
    }
}

impl Drop for CategoryWriter {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for CategoryWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CategoryWriter")
            .field("category", &self.category)
            .field("overflow_policy", &self.overflow_policy)
            .field("flush_timeout", &self.flush_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests;
