use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, warn};

use crate::storage::atomic::{self, PersistError};
use crate::storage::timefmt;

/// Persisted state of the single background job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobStatus {
    /// Whether a job is executing right now
    pub running: bool,

    /// When the last job was started
    #[serde(with = "timefmt::option")]
    pub started_at: Option<NaiveDateTime>,

    /// Cycle budget of the last job (0 = unbounded)
    pub cycles: u32,

    /// Duration budget of the last job in hours
    pub hours: Option<f64>,

    /// Set by a stop request, observed by the worker once per cycle
    pub stop_requested: bool,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self {
            running: false,
            started_at: None,
            cycles: 0,
            hours: None,
            stop_requested: false,
        }
    }
}

/// File-backed job status. Missing or corrupt files are replaced by defaults.
#[derive(Debug, Clone)]
pub struct StatusStore {
    path: PathBuf,
}

impl StatusStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[cfg(test)]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Load the status, creating the file with defaults on first access.
    pub fn load(&self) -> JobStatus {
        match atomic::read_json::<JobStatus>(&self.path) {
            Ok(Some(mut status)) => {
                if !status.running && status.stop_requested {
                    debug!("Clearing stale stop request on idle status");
                    status.stop_requested = false;
                }
                status
            }
            Ok(None) => {
                debug!("No status file at {}, creating default", self.path.display());
                let status = JobStatus::default();
                self.save_logged(&status);
                status
            }
            Err(e) => {
                warn!("Resetting unreadable status file: {}", e);
                let status = JobStatus::default();
                self.save_logged(&status);
                status
            }
        }
    }

    pub fn save(&self, status: &JobStatus) -> Result<(), PersistError> {
        atomic::write_json(&self.path, status)
    }

    fn save_logged(&self, status: &JobStatus) {
        if let Err(e) = self.save(status) {
            error!("Failed to write status file: {}", e);
        }
    }
}

/// Process-wide guarded access to the status file. Every read-modify-write
/// happens under one lock so concurrent control requests and the worker never
/// lose an update.
#[derive(Debug, Clone)]
pub struct StatusHandle {
    store: Arc<Mutex<StatusStore>>,
}

impl StatusHandle {
    pub fn new(store: StatusStore) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StatusStore> {
        // Poison is ignored: the file is only ever replaced whole
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn read(&self) -> JobStatus {
        self.lock().load()
    }

    /// Load, let `f` inspect and mutate, then persist if `f` says so.
    /// `f` returns `(value, changed)`. A change that cannot be written is an
    /// error and `value` is discarded.
    pub fn update<R>(&self, f: impl FnOnce(&mut JobStatus) -> (R, bool)) -> Result<R, PersistError> {
        let store = self.lock();
        let mut status = store.load();
        let (result, changed) = f(&mut status);
        if changed {
            store.save(&status)?;
        }
        Ok(result)
    }
}
