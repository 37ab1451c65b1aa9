// src/lock.rs
//! Single-instance lock keyed by process id.
//!
//! The lock file holds `{pid, started_at}` and is guarded by an exclusive advisory
//! lock (`flock`) on the open handle for as long as the guard lives. A handle that
//! cannot be locked means a live holder. A file we can lock is only taken over when
//! its recorded pid is gone (or it records nothing at all, i.e. its writer died
//! before finishing). Dropping the guard removes the file.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockMetadata {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

impl LockMetadata {
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("another instance is running (pid {pid}, since {since})")]
    Held { pid: u32, since: DateTime<Utc> },
    /// Locked by a process that has not recorded itself yet.
    #[error("another instance is starting (lock {path} is held)")]
    Busy { path: PathBuf },
    #[error("lock file {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

/// Held for the life of the process; released on drop.
#[derive(Debug)]
pub struct InstanceLock {
    // keeps the flock alive
    file: File,
    path: PathBuf,
    meta: LockMetadata,
}

impl InstanceLock {
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self, LockError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| io_err(&path, e))?;
        }

        // retry only when a releasing holder unlinked the file under us
        for _ in 0..3 {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .map_err(|e| io_err(&path, e))?;

            if let Err(e) = file.try_lock_exclusive() {
                if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                    return Err(match read_holder(&path) {
                        Some(h) => LockError::Held {
                            pid: h.pid,
                            since: h.started_at,
                        },
                        None => LockError::Busy { path },
                    });
                }
                return Err(io_err(&path, e));
            }

            if !same_file(&file, &path) {
                continue;
            }

            let meta = LockMetadata::current();
            match read_holder(&path) {
                Some(h) if h.pid != meta.pid && process_alive(h.pid) => {
                    // unlocked but recorded by a running process: not ours to take
                    return Err(LockError::Held {
                        pid: h.pid,
                        since: h.started_at,
                    });
                }
                Some(h) if h.pid != meta.pid => tracing::warn!(
                    path = %path.display(),
                    stale_pid = h.pid,
                    since = %h.started_at,
                    "reclaiming lock left by a process that is no longer running"
                ),
                Some(_) => {}
                None if file_len(&file) > 0 => {
                    tracing::warn!(path = %path.display(), "reclaiming unreadable lock file")
                }
                None => {}
            }

            write_metadata(&file, &meta).map_err(|e| io_err(&path, e))?;
            tracing::debug!(path = %path.display(), pid = meta.pid, "instance lock acquired");
            return Ok(Self { file, path, meta });
        }

        Err(io_err(
            &path,
            io::Error::new(
                io::ErrorKind::AlreadyExists,
                "lock file kept changing while acquiring",
            ),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> &LockMetadata {
        &self.meta
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // unlink while still locked; the flock goes with the handle
        if !same_file(&self.file, &self.path) {
            return;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "failed to remove instance lock"
            );
        } else {
            tracing::debug!(path = %self.path.display(), "instance lock released");
        }
    }
}

fn io_err(path: &Path, source: io::Error) -> LockError {
    LockError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Current holder recorded in `path`, if the file exists and parses.
pub fn read_holder(path: &Path) -> Option<LockMetadata> {
    let raw = fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

fn write_metadata(file: &File, meta: &LockMetadata) -> io::Result<()> {
    let json = serde_json::to_vec(meta).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    file.set_len(0)?;
    let mut w = file;
    w.write_all(&json)?;
    w.sync_all()
}

fn file_len(file: &File) -> u64 {
    file.metadata().map(|m| m.len()).unwrap_or(0)
}

/// Whether `path` still names the file behind `file`.
#[cfg(unix)]
fn same_file(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (file.metadata(), fs::metadata(path)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_file(_file: &File, path: &Path) -> bool {
    path.exists()
}

#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only checks that the process exists and may be signalled.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    // no cheap liveness check here; never reclaim a possibly-live lock
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_metadata_and_drop_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/feedgate.lock");
        {
            let lock = InstanceLock::acquire(&path).unwrap();
            let holder = read_holder(&path).unwrap();
            assert_eq!(holder.pid, std::process::id());
            assert_eq!(&holder, lock.metadata());
        }
        assert!(!path.exists());
    }

    #[test]
    fn second_acquire_in_same_process_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feedgate.lock");
        let first = InstanceLock::acquire(&path).unwrap();
        match InstanceLock::acquire(&path) {
            Err(LockError::Held { pid, .. }) => assert_eq!(pid, std::process::id()),
            other => panic!("expected Held, got {other:?}"),
        }
        // the refused attempt must not have touched the file
        assert_eq!(read_holder(&path).as_ref(), Some(first.metadata()));
    }

    #[test]
    fn unlocked_garbage_file_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feedgate.lock");
        fs::write(&path, "not json").unwrap();
        let lock = InstanceLock::acquire(&path).unwrap();
        assert_eq!(read_holder(&path).unwrap().pid, lock.metadata().pid);
    }

    #[test]
    fn empty_file_under_a_live_flock_is_not_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feedgate.lock");
        // a holder that has locked but not written yet
        let starting = File::create(&path).unwrap();
        starting.try_lock_exclusive().unwrap();

        match InstanceLock::acquire(&path) {
            Err(LockError::Busy { .. }) => {}
            other => panic!("expected Busy, got {other:?}"),
        }
        assert!(path.exists());
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn drop_leaves_a_replaced_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feedgate.lock");
        let lock = InstanceLock::acquire(&path).unwrap();
        // someone unlinked ours and put a new file in its place
        fs::remove_file(&path).unwrap();
        fs::write(&path, "{}").unwrap();
        drop(lock);
        assert!(path.exists());
    }
}
