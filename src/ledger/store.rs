//! File-backed run ledger.
//!
//! Layout per run (`<root>/<org>/<project>/<unique-id>/`):
//! - `sequence`: last appended event id
//! - `metadata.json`: immutable run metadata
//! - `state.json`: materialized state, rewritten after each append
//! - `events/{seq:06}-{type}.json`: one file per event
//! - `.lock`: advisory lock held by whichever process is appending

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, instrument};

use super::event::{Event, NewEvent};
use super::lock::FileLock;
use super::run_id::{RunId, RunMetadata};
use crate::state::RunState;

const SEQUENCE_FILE: &str = "sequence";
const METADATA_FILE: &str = "metadata.json";
const STATE_FILE: &str = "state.json";
const EVENTS_DIR: &str = "events";
const LOCK_FILE: &str = ".lock";

// Serializes appenders to the same run directory within this process;
// other processes are kept out by the `.lock` file
lazy_static::lazy_static! {
    static ref RUN_LOCKS: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>> = Mutex::new(HashMap::new());
}

fn run_lock(dir: &Path) -> Result<Arc<Mutex<()>>, LedgerError> {
    let mut locks = RUN_LOCKS.lock().map_err(|_| LedgerError::LockPoisoned)?;
    Ok(locks
        .entry(dir.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone())
}

/// Storage failures. All of them are fatal to the caller.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed JSON at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("run {0} already exists")]
    RunExists(RunId),
    #[error("run {0} not found")]
    RunNotFound(RunId),
    #[error("sequence conflict in run {run_id}: event {event_id} already written")]
    SequenceConflict { run_id: RunId, event_id: u64 },
    #[error("ledger for run {run_id} is corrupt: {detail}")]
    Corrupt { run_id: RunId, detail: String },
    #[error("ledger lock poisoned")]
    LockPoisoned,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> LedgerError + '_ {
    move |source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Append-only event ledger rooted at a directory
#[derive(Debug, Clone)]
pub struct Ledger {
    root: PathBuf,
}

impl Ledger {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.root.join(run_id.relative_path())
    }

    pub fn exists(&self, run_id: &RunId) -> bool {
        self.run_dir(run_id).join(METADATA_FILE).exists()
    }

    /// Create the run directory and write its immutable metadata
    #[instrument(skip_all, fields(run_id = %metadata.run_id))]
    pub fn create_run(&self, metadata: &RunMetadata) -> Result<(), LedgerError> {
        let dir = self.run_dir(&metadata.run_id);
        let lock = run_lock(&dir)?;
        let _guard = lock.lock().map_err(|_| LedgerError::LockPoisoned)?;

        if dir.join(METADATA_FILE).exists() {
            return Err(LedgerError::RunExists(metadata.run_id.clone()));
        }

        let events = dir.join(EVENTS_DIR);
        fs::create_dir_all(&events).map_err(io_err(&events))?;
        let lock_path = dir.join(LOCK_FILE);
        let _file_lock = FileLock::acquire(&lock_path).map_err(io_err(&lock_path))?;

        let contents = to_json(&dir.join(METADATA_FILE), metadata)?;
        match publish_new(&dir.join(METADATA_FILE), &contents) {
            Err(PublishError::Exists) => {
                return Err(LedgerError::RunExists(metadata.run_id.clone()))
            }
            Err(PublishError::Ledger(e)) => return Err(e),
            Ok(()) => {}
        }
        write_atomic(&dir.join(SEQUENCE_FILE), b"0")?;

        debug!(dir = %dir.display(), "Created run ledger");
        Ok(())
    }

    pub fn read_metadata(&self, run_id: &RunId) -> Result<RunMetadata, LedgerError> {
        let path = self.run_dir(run_id).join(METADATA_FILE);
        if !path.exists() {
            return Err(LedgerError::RunNotFound(run_id.clone()));
        }
        read_json(&path)
    }

    /// Id of the last appended event, without reading the events
    pub fn sequence(&self, run_id: &RunId) -> Result<u64, LedgerError> {
        let dir = self.run_dir(run_id);
        if !dir.join(METADATA_FILE).exists() {
            return Err(LedgerError::RunNotFound(run_id.clone()));
        }
        read_sequence(&dir, run_id)
    }

    /// Append one event and return its id.
    ///
    /// The id is assigned from the `sequence` counter while holding both the
    /// in-process run lock and the run's `.lock` file. The event file is
    /// created with create-new semantics before the counter moves, so a crash
    /// between the two (or a writer ignoring the lock) leaves a detectable
    /// conflict rather than a silent gap or overwrite.
    #[instrument(skip_all, fields(run_id = %run_id, event_type = %event.event_type))]
    pub fn append(&self, run_id: &RunId, event: NewEvent) -> Result<Event, LedgerError> {
        let dir = self.run_dir(run_id);
        if !dir.join(METADATA_FILE).exists() {
            return Err(LedgerError::RunNotFound(run_id.clone()));
        }

        let lock = run_lock(&dir)?;
        let _guard = lock.lock().map_err(|_| LedgerError::LockPoisoned)?;
        let lock_path = dir.join(LOCK_FILE);
        let _file_lock = FileLock::acquire(&lock_path).map_err(io_err(&lock_path))?;

        let current = read_sequence(&dir, run_id)?;
        let next = current + 1;
        let events_dir = dir.join(EVENTS_DIR);

        let prefix = format!("{next:06}-");
        for entry in fs::read_dir(&events_dir).map_err(io_err(&events_dir))? {
            let entry = entry.map_err(io_err(&events_dir))?;
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                return Err(LedgerError::SequenceConflict {
                    run_id: run_id.clone(),
                    event_id: next,
                });
            }
        }

        let event = event.stamp(next, Utc::now());
        let path = events_dir.join(event.file_name());
        let contents = to_json(&path, &event)?;
        match publish_new(&path, &contents) {
            Err(PublishError::Exists) => {
                return Err(LedgerError::SequenceConflict {
                    run_id: run_id.clone(),
                    event_id: next,
                })
            }
            Err(PublishError::Ledger(e)) => return Err(e),
            Ok(()) => {}
        }
        write_atomic(&dir.join(SEQUENCE_FILE), next.to_string().as_bytes())?;

        debug!(event_id = next, "Appended event");
        Ok(event)
    }

    /// All events of a run in causal order.
    ///
    /// Fails if ids are not exactly `1..=n` or a file name disagrees with its
    /// payload.
    pub fn read_all(&self, run_id: &RunId) -> Result<Vec<Event>, LedgerError> {
        let dir = self.run_dir(run_id);
        if !dir.join(METADATA_FILE).exists() {
            return Err(LedgerError::RunNotFound(run_id.clone()));
        }

        let events_dir = dir.join(EVENTS_DIR);
        let mut names = Vec::new();
        for entry in fs::read_dir(&events_dir).map_err(io_err(&events_dir))? {
            let entry = entry.map_err(io_err(&events_dir))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".json") && !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();

        let mut events = Vec::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            let event: Event = read_json(&events_dir.join(name))?;
            let expected = i as u64 + 1;
            if event.event_id != expected {
                return Err(LedgerError::Corrupt {
                    run_id: run_id.clone(),
                    detail: format!("expected event {expected}, found {}", event.event_id),
                });
            }
            if *name != event.file_name() {
                return Err(LedgerError::Corrupt {
                    run_id: run_id.clone(),
                    detail: format!("file {name} does not match event {}", event.event_id),
                });
            }
            events.push(event);
        }

        let sequence = read_sequence(&dir, run_id)?;
        if sequence != events.len() as u64 {
            return Err(LedgerError::Corrupt {
                run_id: run_id.clone(),
                detail: format!(
                    "sequence counter is {sequence} but {} events are on disk",
                    events.len()
                ),
            });
        }

        Ok(events)
    }

    /// Persist the materialized state document
    pub fn write_state(&self, run_id: &RunId, state: &RunState) -> Result<(), LedgerError> {
        write_json_atomic(&self.run_dir(run_id).join(STATE_FILE), state)
    }

    /// Last materialized state, if one has been written
    pub fn read_state(&self, run_id: &RunId) -> Result<Option<RunState>, LedgerError> {
        let path = self.run_dir(run_id).join(STATE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    /// Every run under the root, sorted by id
    pub fn list_runs(&self) -> Result<Vec<RunId>, LedgerError> {
        let mut runs = Vec::new();
        if !self.root.exists() {
            return Ok(runs);
        }
        for org in subdirs(&self.root)? {
            for project in subdirs(&org)? {
                for run in subdirs(&project)? {
                    if !run.join(METADATA_FILE).exists() {
                        continue;
                    }
                    let name = |p: &Path| {
                        p.file_name()
                            .map(|n| n.to_string_lossy().to_string())
                            .unwrap_or_default()
                    };
                    if let Ok(id) = RunId::new(&name(&org), &name(&project), &name(&run)) {
                        runs.push(id);
                    }
                }
            }
        }
        runs.sort();
        Ok(runs)
    }
}

fn subdirs(path: &Path) -> Result<Vec<PathBuf>, LedgerError> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(path).map_err(io_err(path))? {
        let entry = entry.map_err(io_err(path))?;
        let p = entry.path();
        if p.is_dir() {
            dirs.push(p);
        }
    }
    Ok(dirs)
}

fn read_sequence(dir: &Path, run_id: &RunId) -> Result<u64, LedgerError> {
    let path = dir.join(SEQUENCE_FILE);
    if !path.exists() {
        return Ok(0);
    }
    let raw = fs::read_to_string(&path).map_err(io_err(&path))?;
    raw.trim().parse().map_err(|_| LedgerError::Corrupt {
        run_id: run_id.clone(),
        detail: format!("unreadable sequence counter '{}'", raw.trim()),
    })
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, LedgerError> {
    let contents = fs::read_to_string(path).map_err(io_err(path))?;
    serde_json::from_str(&contents).map_err(|source| LedgerError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn to_json<T: Serialize>(path: &Path, value: &T) -> Result<Vec<u8>, LedgerError> {
    serde_json::to_vec_pretty(value).map_err(|source| LedgerError::Json {
        path: path.to_path_buf(),
        source,
    })
}

pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), LedgerError> {
    write_atomic(path, &to_json(path, value)?)
}

/// Hidden temp file beside `path`, unique per writer
fn temp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()))
}

/// Write to a temp file beside `path`, then rename over it
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), LedgerError> {
    let tmp = temp_path(path);
    fs::write(&tmp, contents).map_err(io_err(&tmp))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        io_err(path)(e)
    })
}

enum PublishError {
    Exists,
    Ledger(LedgerError),
}

/// Make a fully written file appear at `path` only if nothing is there yet.
///
/// The hard link fails atomically when `path` exists, so readers never see a
/// partial file and a second writer never replaces the first.
fn publish_new(path: &Path, contents: &[u8]) -> Result<(), PublishError> {
    let tmp = temp_path(path);
    fs::write(&tmp, contents).map_err(|e| PublishError::Ledger(io_err(&tmp)(e)))?;
    let linked = fs::hard_link(&tmp, path);
    let _ = fs::remove_file(&tmp);
    match linked {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(PublishError::Exists),
        Err(e) => Err(PublishError::Ledger(io_err(path)(e))),
    }
}
