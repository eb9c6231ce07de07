//! Advisory file locks.
//!
//! Two locks protect the state root:
//!
//! - `<root>/.lock` is held shared by every build and image import, and
//!   exclusively by `kiln prune`, so prune never deletes an entry a build is
//!   about to read. It is taken without blocking; a busy lock reports who
//!   holds it.
//! - [`FileLock`] guards short read-modify-write sections, such as the image
//!   index, across processes. It blocks until the lock is free.
//!
//! All locks are released when dropped.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const LOCK_FILENAME: &str = ".lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  Shared,
  Exclusive,
}

/// Written into the lock file by an exclusive holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
  pub pid: u32,
  pub command: String,
  pub acquired_at: u64,
}

impl fmt::Display for LockHolder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} (PID {}, since Unix timestamp {})", self.command, self.pid, self.acquired_at)
  }
}

#[derive(Debug, Error)]
pub enum StoreLockError {
  #[error("{}", busy_message(holder.as_ref(), lock_path))]
  Busy {
    holder: Option<LockHolder>,
    lock_path: PathBuf,
  },

  #[error("failed to lock {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

fn busy_message(holder: Option<&LockHolder>, lock_path: &Path) -> String {
  let who = match holder {
    Some(holder) => format!("state root is locked by {}", holder),
    None => "state root is locked by another kiln process".to_string(),
  };
  format!(
    "{}\nIf you're sure no kiln process is running, remove the lock file:\n  {}",
    who,
    lock_path.display()
  )
}

/// A held lock on a state root.
#[derive(Debug)]
pub struct StoreLock {
  file: File,
  lock_path: PathBuf,
  mode: LockMode,
}

impl StoreLock {
  /// Try to lock `root` without blocking, creating it if needed.
  pub fn acquire(root: &Path, mode: LockMode, command: &str) -> Result<Self, StoreLockError> {
    let lock_path = root.join(LOCK_FILENAME);
    let io_err = |source| StoreLockError::Io {
      path: lock_path.clone(),
      source,
    };

    std::fs::create_dir_all(root).map_err(io_err)?;
    let file = open_lock_file(&lock_path).map_err(io_err)?;

    match sys::lock(&file, mode, false) {
      Ok(()) => {}
      Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
        return Err(StoreLockError::Busy {
          holder: read_holder(&lock_path),
          lock_path,
        });
      }
      Err(e) => return Err(io_err(e)),
    }

    let lock = StoreLock {
      file,
      lock_path: lock_path.clone(),
      mode,
    };
    if mode == LockMode::Exclusive {
      lock.record_holder(command).map_err(io_err)?;
    }

    debug!(path = ?lock.lock_path, ?mode, "acquired state root lock");
    Ok(lock)
  }

  pub fn lock_path(&self) -> &Path {
    &self.lock_path
  }

  pub fn mode(&self) -> LockMode {
    self.mode
  }

  /// The holder recorded by this exclusive lock.
  ///
  /// Read through the held handle: a second handle cannot read a locked file
  /// on Windows.
  pub fn holder(&self) -> io::Result<LockHolder> {
    let mut file = &self.file;
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).map_err(io::Error::other)
  }

  fn record_holder(&self, command: &str) -> io::Result<()> {
    let holder = LockHolder {
      pid: std::process::id(),
      command: command.to_string(),
      acquired_at: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
    };
    let json = serde_json::to_vec(&holder).map_err(io::Error::other)?;

    let mut file = &self.file;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&json)?;
    file.flush()
  }
}

fn read_holder(lock_path: &Path) -> Option<LockHolder> {
  let contents = std::fs::read_to_string(lock_path).ok()?;
  serde_json::from_str(&contents).ok()
}

fn open_lock_file(path: &Path) -> io::Result<File> {
  OpenOptions::new()
    .read(true)
    .write(true)
    .create(true)
    .truncate(false)
    .open(path)
}

/// A blocking, exclusive lock on a sidecar file.
#[derive(Debug)]
pub struct FileLock {
  _file: File,
}

impl FileLock {
  /// Wait until `path` can be locked exclusively. The file is created if
  /// missing and never removed.
  pub fn exclusive(path: &Path) -> io::Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    let file = open_lock_file(path)?;
    sys::lock(&file, LockMode::Exclusive, true)?;
    Ok(Self { _file: file })
  }
}

#[cfg(unix)]
mod sys {
  use super::LockMode;
  use rustix::fs::{FlockOperation, flock};
  use std::fs::File;
  use std::io;
  use std::os::unix::io::AsFd;

  pub(super) fn lock(file: &File, mode: LockMode, wait: bool) -> io::Result<()> {
    let operation = match (mode, wait) {
      (LockMode::Shared, false) => FlockOperation::NonBlockingLockShared,
      (LockMode::Exclusive, false) => FlockOperation::NonBlockingLockExclusive,
      (LockMode::Shared, true) => FlockOperation::LockShared,
      (LockMode::Exclusive, true) => FlockOperation::LockExclusive,
    };
    flock(file.as_fd(), operation).map_err(io::Error::from)
  }
}

#[cfg(windows)]
mod sys {
  use super::LockMode;
  use std::fs::File;
  use std::io;
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::HANDLE;
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};

  pub(super) fn lock(file: &File, mode: LockMode, wait: bool) -> io::Result<()> {
    let mut flags = 0;
    if mode == LockMode::Exclusive {
      flags |= LOCKFILE_EXCLUSIVE_LOCK;
    }
    if !wait {
      flags |= LOCKFILE_FAIL_IMMEDIATELY;
    }

    // SAFETY: the handle is valid for the lifetime of `file` and a zeroed
    // OVERLAPPED is a valid argument for a synchronous handle.
    let result = unsafe {
      let mut overlapped = std::mem::zeroed();
      LockFileEx(file.as_raw_handle() as HANDLE, flags, 0, 1, 0, &mut overlapped)
    };

    if result == 0 {
      Err(io::Error::last_os_error())
    } else {
      Ok(())
    }
  }
}
