//! Serial worker thread owning a [`CategoryStore`].
//!
//! Every command for a category, whether an append, a flush or a task queued
//! by the delivery coordinator, is applied by this thread in FIFO order. The
//! store is never touched from anywhere else, which keeps rotation and buffer
//! preparation free of explicit file locks.

use std::{
    io,
    sync::{Arc, Barrier},
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, Sender, bounded};
use log::{error, trace, warn};

use crate::{codec, record::EventRecord, store::CategoryStore};

/// Name prefix of every writer thread.
pub(crate) const WRITER_THREAD_PREFIX: &str = "femtotelemetry-writer-";

/// Closure executed on the worker with exclusive access to the store.
pub(crate) type SerialTask = Box<dyn FnOnce(&mut CategoryStore) + Send>;

/// Commands sent to the worker thread.
pub(crate) enum WriterCommand {
    Record(Box<EventRecord>),
    /// Write and sync, then report whether the record was persisted.
    Durable(Box<EventRecord>, Sender<bool>),
    Flush(Sender<()>),
    Task(SerialTask),
}

pub(crate) struct WorkerConfig {
    pub capacity: usize,
    pub start_barrier: Option<Arc<Barrier>>,
}

/// Channels and handle returned by [`spawn_worker`].
pub(crate) struct WorkerParts {
    pub tx: Sender<WriterCommand>,
    pub done_rx: Receiver<()>,
    pub handle: JoinHandle<()>,
}

/// Whether the calling thread is one of the writer workers.
///
/// Code that may run on a worker, such as a panic hook, must not block on a
/// writer acknowledgement from that thread.
pub(crate) fn on_writer_thread() -> bool {
    thread::current()
        .name()
        .is_some_and(|name| name.starts_with(WRITER_THREAD_PREFIX))
}

pub(crate) fn spawn_worker(store: CategoryStore, config: WorkerConfig) -> io::Result<WorkerParts> {
    let WorkerConfig {
        capacity,
        start_barrier,
    } = config;
    let (tx, rx) = bounded(capacity);
    let (done_tx, done_rx) = bounded(1);
    let name = format!("{WRITER_THREAD_PREFIX}{}", store.category());
    let handle = thread::Builder::new().name(name).spawn(move || {
        if let Some(barrier) = start_barrier {
            barrier.wait();
        }
        Worker { store }.run(rx);
        let _ = done_tx.send(());
    })?;
    Ok(WorkerParts {
        tx,
        done_rx,
        handle,
    })
}

struct Worker {
    store: CategoryStore,
}

impl Worker {
    fn run(mut self, rx: Receiver<WriterCommand>) {
        for cmd in rx {
            match cmd {
                WriterCommand::Record(record) => {
                    self.append(&record, false);
                }
                WriterCommand::Durable(record, ack) => {
                    let persisted = self.append(&record, true);
                    let _ = ack.send(persisted);
                }
                WriterCommand::Flush(ack) => {
                    if let Err(err) = self.store.sync() {
                        warn!("femtotelemetry: {err}");
                    }
                    let _ = ack.send(());
                }
                WriterCommand::Task(task) => task(&mut self.store),
            }
        }
        if let Err(err) = self.store.sync() {
            warn!("femtotelemetry: {err}");
        }
    }

    fn append(&mut self, record: &EventRecord, sync: bool) -> bool {
        let category = self.store.category();
        let encoded = match codec::encode(record) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(
                    "femtotelemetry: dropping {category} record from {:?}: {err}",
                    record.source()
                );
                return false;
            }
        };
        match self.store.append(&encoded, sync) {
            Ok(outcome) => {
                if outcome.rotated {
                    trace!("femtotelemetry: {category} store rotated before append");
                }
                true
            }
            Err(err) => {
                error!("femtotelemetry: dropping {category} record: {err}");
                false
            }
        }
    }
}
