//! State directory resolution.
//!
//! Everything kiln persists lives under one state root:
//!
//! ```text
//! <root>/
//! ├── .lock                 # store lock (shared for builds, exclusive for prune)
//! ├── cache/snapshots/      # committed snapshot cache entries, by cache key
//! ├── cache/staging/        # in-flight executions
//! └── images/               # image store: blobs, index.json, snapshotters/
//! ```

use std::path::PathBuf;

use crate::consts::{APP_NAME, ROOT_ENV};

/// Returns the user's home directory
#[cfg(windows)]
pub fn home_dir() -> PathBuf {
  std::env::var("USERPROFILE")
    .map(PathBuf::from)
    .unwrap_or_else(|_| std::env::temp_dir())
}

/// Returns the user's home directory
#[cfg(not(windows))]
pub fn home_dir() -> PathBuf {
  std::env::var("HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| std::env::temp_dir())
}

/// Returns the directory for data files for the application
#[cfg(windows)]
pub fn data_dir() -> PathBuf {
  std::env::var("APPDATA")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir())
    .join(APP_NAME)
}

/// Returns the directory for data files for the application
#[cfg(not(windows))]
pub fn data_dir() -> PathBuf {
  let data_home = std::env::var("XDG_DATA_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join(".local").join("share"));
  data_home.join(APP_NAME)
}

/// Returns the state root, honoring `KILN_ROOT`.
pub fn root_dir() -> PathBuf {
  if let Ok(path) = std::env::var(ROOT_ENV)
    && !path.is_empty()
  {
    return PathBuf::from(path);
  }
  data_dir()
}

pub fn snapshots_dir(root: &std::path::Path) -> PathBuf {
  root.join("cache").join("snapshots")
}

pub fn staging_dir(root: &std::path::Path) -> PathBuf {
  root.join("cache").join("staging")
}

pub fn images_dir(root: &std::path::Path) -> PathBuf {
  root.join("images")
}
