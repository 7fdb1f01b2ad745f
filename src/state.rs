//! Small persisted key-value state.
//!
//! The engine keeps a handful of process-spanning facts, most notably the
//! crash flag, in a JSON document next to the category files. Updates are
//! written to a temporary file and renamed into place so a crash mid-write
//! leaves the previous document intact.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use log::warn;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use thiserror::Error;

/// File name of the persisted state document.
pub const STATE_FILE_NAME: &str = "telemetry_state.json";
/// Key recording that an uncaught failure happened.
pub const CRASH_FLAG_KEY: &str = "uncaught_exception_occurred";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to persist state to {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode state document: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Explicit get/set access to persisted values.
pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value) -> Result<(), StateError>;
    fn remove(&self, key: &str) -> Result<(), StateError>;
}

/// State kept in memory only; nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    values: Mutex<Map<String, Value>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StateError> {
        self.values.lock().insert(key.to_owned(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StateError> {
        self.values.lock().remove(key);
        Ok(())
    }
}

/// JSON document on disk, cached in memory.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl FileStateStore {
    /// Open the state document in `dir`.
    ///
    /// A missing document starts empty. An unreadable or corrupt document is
    /// reported and replaced on the next write.
    pub fn open(dir: &Path) -> Self {
        let path = dir.join(STATE_FILE_NAME);
        let values = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Map<String, Value>>(&bytes) {
                Ok(values) => values,
                Err(err) => {
                    warn!(
                        "femtotelemetry: ignoring corrupt state document {}: {err}",
                        path.display()
                    );
                    Map::new()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => Map::new(),
            Err(err) => {
                warn!(
                    "femtotelemetry: cannot read state document {}: {err}",
                    path.display()
                );
                Map::new()
            }
        };
        Self {
            path,
            values: Mutex::new(values),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &Map<String, Value>) -> Result<(), StateError> {
        let bytes = serde_json::to_vec_pretty(values)?;
        let tmp_path = self.path.with_extension("json.tmp");
        let io_err = |source| StateError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        fs::write(&tmp_path, bytes).map_err(io_err)?;
        fs::rename(&tmp_path, &self.path).map_err(io_err)
    }

    fn update(&self, apply: impl FnOnce(&mut Map<String, Value>)) -> Result<(), StateError> {
        let mut values = self.values.lock();
        let mut next = values.clone();
        apply(&mut next);
        if next == *values {
            return Ok(());
        }
        self.persist(&next)?;
        *values = next;
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StateError> {
        self.update(|values| {
            values.insert(key.to_owned(), value);
        })
    }

    fn remove(&self, key: &str) -> Result<(), StateError> {
        self.update(|values| {
            values.remove(key);
        })
    }
}

/// Persisted "an uncaught failure occurred" flag.
///
/// The persisted value survives restarts until a successful operational send
/// clears it. Separately the flag tracks whether the failure happened in the
/// current process, which decides how an open session is closed.
pub struct CrashFlag {
    store: Arc<dyn StateStore>,
    fired: AtomicBool,
}

impl CrashFlag {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            fired: AtomicBool::new(false),
        }
    }

    /// Persisted value; `false` when absent or not a boolean.
    pub fn load(&self) -> bool {
        self.store
            .get(CRASH_FLAG_KEY)
            .and_then(|value| value.as_bool())
            .unwrap_or(false)
    }

    pub fn store(&self, occurred: bool) -> Result<(), StateError> {
        self.store.set(CRASH_FLAG_KEY, Value::Bool(occurred))
    }

    pub fn clear(&self) -> Result<(), StateError> {
        self.store.remove(CRASH_FLAG_KEY)
    }

    /// Record a failure in this process and persist the flag.
    pub fn mark(&self) {
        self.fired.store(true, Ordering::SeqCst);
        if let Err(err) = self.store(true) {
            warn!("femtotelemetry: {err}");
        }
    }

    /// Whether [`mark`](Self::mark) was called in this process.
    pub fn fired_in_process(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for CrashFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrashFlag")
            .field("fired", &self.fired_in_process())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn file_store_survives_reopen() {
        let dir = TempDir::new().expect("temp dir");
        let store = FileStateStore::open(dir.path());
        store.set("answer", json!(42)).expect("set");
        drop(store);
        let reopened = FileStateStore::open(dir.path());
        assert_eq!(reopened.get("answer"), Some(json!(42)));
        assert!(!dir.path().join("telemetry_state.json.tmp").exists());
    }

    #[test]
    fn corrupt_document_starts_empty() {
        let dir = TempDir::new().expect("temp dir");
        fs::write(dir.path().join(STATE_FILE_NAME), b"{not json").expect("write");
        let store = FileStateStore::open(dir.path());
        assert_eq!(store.get("anything"), None);
        store.set("k", json!("v")).expect("rewrite");
        let reopened = FileStateStore::open(dir.path());
        assert_eq!(reopened.get("k"), Some(json!("v")));
    }

    #[test]
    fn remove_of_absent_key_is_noop() {
        let dir = TempDir::new().expect("temp dir");
        let store = FileStateStore::open(dir.path());
        store.remove("missing").expect("remove");
        assert!(!store.path().exists());
    }

    #[test]
    fn crash_flag_round_trips_through_store() {
        let dir = TempDir::new().expect("temp dir");
        let flag = CrashFlag::new(Arc::new(FileStateStore::open(dir.path())));
        assert!(!flag.load());
        flag.mark();
        assert!(flag.fired_in_process());
        let next_run = CrashFlag::new(Arc::new(FileStateStore::open(dir.path())));
        assert!(next_run.load());
        assert!(!next_run.fired_in_process());
        next_run.clear().expect("clear");
        assert!(!next_run.load());
    }

    #[test]
    fn non_boolean_flag_reads_as_false() {
        let store = Arc::new(MemoryStateStore::new());
        store.set(CRASH_FLAG_KEY, json!("yes")).expect("set");
        assert!(!CrashFlag::new(store).load());
    }
}
