//! Cross-process advisory locks on a sidecar file.
//!
//! In-process mutexes only order threads of one `runwarden`; a second
//! process (a `cancel` next to a running `run`, two runs sharing a knowledge
//! base) goes through the OS lock instead.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

/// An exclusive lock, released on drop
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the exclusive lock on `path` is held.
    ///
    /// The lock file is created if missing and never removed; its contents
    /// are irrelevant.
    pub fn acquire(path: &Path) -> io::Result<Self> {
        let file = open(path)?;
        file.lock_exclusive()?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Take the lock only if nobody else holds it
    pub fn try_acquire(path: &Path) -> io::Result<Option<Self>> {
        let file = open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "Failed to release file lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    #[test]
    fn test_second_handle_is_locked_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".lock");

        let held = FileLock::acquire(&path).unwrap();
        assert!(FileLock::try_acquire(&path).unwrap().is_none());

        drop(held);
        assert!(FileLock::try_acquire(&path).unwrap().is_some());
    }

    #[test]
    fn test_acquire_waits_for_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".lock");
        let held = FileLock::acquire(&path).unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter_path = path.clone();
        let waiter = std::thread::spawn(move || {
            let started = Instant::now();
            let _lock = FileLock::acquire(&waiter_path).unwrap();
            tx.send(started.elapsed()).unwrap();
        });

        std::thread::sleep(Duration::from_millis(150));
        assert!(rx.try_recv().is_err());
        drop(held);

        let waited = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(waited >= Duration::from_millis(100));
        waiter.join().unwrap();
    }
}
