//! Durable per-category ring of record files.
//!
//! A category owns three files in the storage directory:
//!
//! - `<category>.log` receives appends (the *active* file);
//! - `<category>.log.overflow` holds the previous active file after a
//!   rotation;
//! - `<category>.log.send` is the outbound buffer created by
//!   [`CategoryStore::prepare_for_send`] and deleted once the collector
//!   acknowledges it.
//!
//! A fourth file, `<category>.log.send.tmp`, exists only while overflow and
//! active are being merged into the outbound buffer.
//!
//! The configured capacity is split evenly between the active and overflow
//! files. When the active file already exceeds half the capacity the next
//! append first renames it over the overflow file, so the overflow file always
//! holds exactly the bytes the active file had at rotation time and records on
//! disk never exceed roughly the configured capacity plus one record.
//!
//! The store is not synchronised; it is owned by a single category worker
//! thread which serialises every operation.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use log::{debug, warn};
use thiserror::Error;

use crate::record::Category;

/// Failure of a filesystem operation; the store state is left unchanged.
#[derive(Debug, Error)]
#[error("storage unavailable while {action} {}: {source}", .path.display())]
pub struct StoreError {
    pub action: &'static str,
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

impl StoreError {
    fn new(action: &'static str, path: &Path, source: io::Error) -> Self {
        Self {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Locations of a category's files.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorePaths {
    pub active: PathBuf,
    pub overflow: PathBuf,
    pub outbound: PathBuf,
    /// Merge target promoted to `outbound` once complete.
    pub staging: PathBuf,
}

impl StorePaths {
    pub fn new(dir: &Path, category: Category) -> Self {
        let stem = category.file_stem();
        Self {
            active: dir.join(format!("{stem}.log")),
            overflow: dir.join(format!("{stem}.log.overflow")),
            outbound: dir.join(format!("{stem}.log.send")),
            staging: dir.join(format!("{stem}.log.send.tmp")),
        }
    }
}

/// Total byte capacity shared between the engine and a store.
///
/// Cloning shares the underlying value so runtime updates reach the worker
/// that owns the store.
#[derive(Clone, Debug)]
pub struct SharedCapacity(Arc<AtomicU64>);

impl SharedCapacity {
    pub fn new(bytes: u64) -> Self {
        Self(Arc::new(AtomicU64::new(bytes)))
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, bytes: u64) {
        self.0.store(bytes, Ordering::Relaxed);
    }
}

/// Outcome of a successful append.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    /// The active file was moved to the overflow slot before writing.
    pub rotated: bool,
}

pub struct CategoryStore {
    category: Category,
    paths: StorePaths,
    capacity: SharedCapacity,
    active: Option<File>,
}

impl CategoryStore {
    /// Create a store rooted in `dir`, creating the directory if required.
    pub fn open(dir: &Path, category: Category, capacity: SharedCapacity) -> Result<Self, StoreError> {
        fs::create_dir_all(dir).map_err(|e| StoreError::new("creating", dir, e))?;
        let store = Self {
            category,
            paths: StorePaths::new(dir, category),
            capacity,
            active: None,
        };
        store.recover_staging()?;
        Ok(store)
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    /// Half of the configured capacity; the active file rotates beyond this.
    pub fn rotation_threshold(&self) -> u64 {
        self.capacity.get() / 2
    }

    /// Append one encoded record, rotating first if the active file is full.
    ///
    /// With `sync` set the data is flushed to stable storage before
    /// returning.
    pub fn append(&mut self, encoded: &str, sync: bool) -> Result<AppendOutcome, StoreError> {
        let mut outcome = AppendOutcome::default();
        if self.active_len()? > self.rotation_threshold() {
            self.rotate()?;
            outcome.rotated = true;
        }
        let path = &self.paths.active;
        let mut file = match self.active.take() {
            Some(file) => file,
            None => open_append(path).map_err(|e| StoreError::new("opening", path, e))?,
        };
        file.write_all(encoded.as_bytes())
            .and_then(|()| if sync { file.sync_data() } else { Ok(()) })
            .map_err(|e| StoreError::new("appending to", path, e))?;
        self.active = Some(file);
        Ok(outcome)
    }

    fn active_len(&self) -> Result<u64, StoreError> {
        let metadata = match &self.active {
            Some(file) => file.metadata(),
            None => fs::metadata(&self.paths.active),
        };
        match metadata {
            Ok(metadata) => Ok(metadata.len()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(err) => Err(StoreError::new("inspecting", &self.paths.active, err)),
        }
    }

    /// Replace the overflow file with the active file and start a fresh one.
    fn rotate(&mut self) -> Result<(), StoreError> {
        self.active = None;
        fs::rename(&self.paths.active, &self.paths.overflow)
            .map_err(|e| StoreError::new("rotating", &self.paths.active, e))?;
        debug!(
            "femtotelemetry: rotated {} into {}",
            self.paths.active.display(),
            self.paths.overflow.display()
        );
        Ok(())
    }

    /// Move accumulated records into the outbound buffer and return them.
    ///
    /// An existing outbound buffer belongs to an unfinished send attempt and
    /// is returned unchanged. Otherwise the overflow file, which only holds
    /// records older than the active file, is placed first. Returns `None`
    /// when there is nothing to send.
    ///
    /// When both files hold records they are merged through a staging file.
    /// The sources are only removed once the staging file is durable, and a
    /// failure leaves every record in exactly one of the ring files.
    pub fn prepare_for_send(&mut self) -> Result<Option<String>, StoreError> {
        if self.paths.outbound.exists() {
            return self.read_outbound().map(Some);
        }
        self.active = None;
        let active = match fs::read(&self.paths.active) {
            Ok(bytes) => Some(bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => {
                warn!(
                    "femtotelemetry: cannot read {}: {err}; nothing to send",
                    self.paths.active.display()
                );
                return Ok(None);
            }
        };
        let has_active = active.as_ref().is_some_and(|bytes| !bytes.is_empty());
        match (self.paths.overflow.exists(), has_active) {
            (false, false) => return Ok(None),
            (false, true) => self.rename(&self.paths.active, &self.paths.outbound)?,
            (true, false) => {
                self.rename(&self.paths.overflow, &self.paths.outbound)?;
                remove_if_present(&self.paths.active)
                    .map_err(|e| StoreError::new("removing", &self.paths.active, e))?;
            }
            (true, true) => self.merge_into_outbound(active.as_deref().unwrap_or_default())?,
        }
        self.read_outbound().map(Some)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), StoreError> {
        fs::rename(from, to).map_err(|e| StoreError::new("moving", from, e))
    }

    /// Write overflow then active into the staging file and promote it.
    fn merge_into_outbound(&self, active: &[u8]) -> Result<(), StoreError> {
        let staging = &self.paths.staging;
        let staged = fs::read(&self.paths.overflow)
            .map_err(|e| StoreError::new("reading", &self.paths.overflow, e))
            .and_then(|overflow| {
                let mut file = File::create(staging)
                    .map_err(|e| StoreError::new("creating", staging, e))?;
                file.write_all(&overflow)
                    .and_then(|()| file.write_all(active))
                    .and_then(|()| file.sync_all())
                    .map_err(|e| StoreError::new("writing", staging, e))
            });
        if let Err(err) = staged {
            let _ = remove_if_present(staging);
            return Err(err);
        }
        if let Err(err) = fs::remove_file(&self.paths.active) {
            let _ = remove_if_present(staging);
            return Err(StoreError::new("removing", &self.paths.active, err));
        }
        // From here the staging file is the only copy of the active records.
        let promoted = remove_if_present(&self.paths.overflow)
            .map_err(|e| StoreError::new("removing", &self.paths.overflow, e))
            .and_then(|()| self.rename(staging, &self.paths.outbound));
        if let Err(err) = promoted {
            self.restore_staged();
            return Err(err);
        }
        Ok(())
    }

    /// Fold a complete staging file back into the overflow slot.
    ///
    /// The staging file holds the overflow records followed by the active
    /// ones, so replacing the overflow file with it keeps every record once.
    fn restore_staged(&self) {
        if let Err(err) = fs::rename(&self.paths.staging, &self.paths.overflow) {
            warn!(
                "femtotelemetry: cannot restore {}: {err}",
                self.paths.staging.display()
            );
        }
    }

    /// Resolve a staging file left behind by an interrupted merge.
    ///
    /// While the active file exists the sources are intact and the staging
    /// file is discarded; otherwise it is complete and becomes the overflow
    /// file.
    fn recover_staging(&self) -> Result<(), StoreError> {
        if !self.paths.staging.exists() {
            return Ok(());
        }
        if self.paths.active.exists() {
            remove_if_present(&self.paths.staging)
                .map_err(|e| StoreError::new("removing", &self.paths.staging, e))
        } else {
            debug!(
                "femtotelemetry: recovering interrupted merge {}",
                self.paths.staging.display()
            );
            self.rename(&self.paths.staging, &self.paths.overflow)
        }
    }

    fn read_outbound(&self) -> Result<String, StoreError> {
        let bytes = fs::read(&self.paths.outbound)
            .map_err(|e| StoreError::new("reading", &self.paths.outbound, e))?;
        Ok(decode_lines(bytes, &self.paths.outbound))
    }

    /// Delete the outbound buffer. Deleting an absent buffer succeeds.
    pub fn discard_sent(&mut self) -> Result<(), StoreError> {
        match fs::remove_file(&self.paths.outbound) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::new("removing", &self.paths.outbound, err)),
        }
    }

    /// Whether an outbound buffer from an earlier attempt is waiting.
    pub fn has_outbound(&self) -> bool {
        self.paths.outbound.exists()
    }

    /// Flush the active file to stable storage.
    pub fn sync(&mut self) -> Result<(), StoreError> {
        match &self.active {
            Some(file) => file
                .sync_data()
                .map_err(|e| StoreError::new("syncing", &self.paths.active, e)),
            None => Ok(()),
        }
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// Decode a buffer, dropping any line that is not valid UTF-8.
fn decode_lines(bytes: Vec<u8>, path: &Path) -> String {
    let bytes = match String::from_utf8(bytes) {
        Ok(text) => return text,
        Err(err) => err.into_bytes(),
    };
    let mut text = String::with_capacity(bytes.len());
    let mut skipped = 0usize;
    for line in bytes.split_inclusive(|&b| b == b'\n') {
        match std::str::from_utf8(line) {
            Ok(line) => text.push_str(line),
            Err(_) => skipped += 1,
        }
    }
    warn!(
        "femtotelemetry: skipped {skipped} undecodable lines in {}",
        path.display()
    );
    text
}
