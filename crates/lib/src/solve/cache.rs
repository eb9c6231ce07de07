//! Snapshot cache.
//!
//! Entries are keyed by cache key and laid out as:
//!
//! ```text
//! cache/snapshots/<key-hex>/
//! ├── .kiln-complete     # marker: output hashes, written last
//! └── outputs/<n>/       # one directory per node output
//! ```
//!
//! Work happens in a private staging directory that is renamed into place only
//! once every output exists and the marker is written. A staging directory that
//! is dropped (failure, cancellation) is deleted, so readers never see a
//! partial entry.

use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::consts::CACHE_COMPLETE_MARKER;
use crate::platform::paths::{snapshots_dir, staging_dir};
use crate::util::fs::remove_path;
use crate::util::hash::{DirHashError, Digest, hash_directory};

const MARKER_VERSION: u32 = 1;
const OUTPUTS_DIR: &str = "outputs";
const ROOTFS_DIR: &str = "rootfs";

#[derive(Debug, Error)]
pub enum CacheError {
  #[error("io error: {0}")]
  Io(#[from] io::Error),

  #[error("failed to hash snapshot: {0}")]
  Hash(#[from] DirHashError),

  #[error("invalid cache marker: {0}")]
  Marker(#[from] serde_json::Error),
}

/// Contents of the completion marker.
#[derive(Debug, Serialize, Deserialize)]
pub struct CacheMarker {
  pub version: u32,
  pub key: Digest,
  pub created_at: u64,
  /// Tree hash of each output, by output index.
  pub outputs: Vec<Digest>,
}

/// A committed cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub key: Digest,
  pub path: PathBuf,
  pub outputs: Vec<PathBuf>,
}

/// An in-progress entry. Deleted on drop unless committed.
#[derive(Debug)]
pub struct StagedEntry {
  dir: TempDir,
  output_count: u32,
}

impl StagedEntry {
  pub fn path(&self) -> &Path {
    self.dir.path()
  }

  /// Scratch root filesystem for an exec.
  pub fn rootfs(&self) -> PathBuf {
    self.dir.path().join(ROOTFS_DIR)
  }

  pub fn output(&self, index: u32) -> PathBuf {
    self.dir.path().join(OUTPUTS_DIR).join(index.to_string())
  }
}

type FlightTable = StdMutex<HashMap<Digest, Arc<Mutex<()>>>>;

/// A caller's membership in the single-flight slot for one key.
///
/// Leaving the slot, including by being dropped mid-computation, removes the
/// table entry once nobody else holds it.
struct Flight<'a> {
  table: &'a FlightTable,
  key: Digest,
  slot: Arc<Mutex<()>>,
}

impl<'a> Flight<'a> {
  fn join(table: &'a FlightTable, key: &Digest) -> Self {
    let mut flights = table.lock().unwrap_or_else(PoisonError::into_inner);
    let slot = flights.entry(key.clone()).or_default().clone();
    Self {
      table,
      key: key.clone(),
      slot,
    }
  }
}

impl Drop for Flight<'_> {
  fn drop(&mut self) {
    let mut flights = self.table.lock().unwrap_or_else(PoisonError::into_inner);
    // One reference in the table, one here: nobody else is waiting.
    if Arc::strong_count(&self.slot) <= 2 {
      flights.remove(&self.key);
    }
  }
}

pub struct SnapshotCache {
  snapshots: PathBuf,
  staging: PathBuf,
  flights: FlightTable,
}

impl SnapshotCache {
  /// Open the cache under the state root `root`.
  pub fn open(root: &Path) -> Self {
    Self {
      snapshots: snapshots_dir(root),
      staging: staging_dir(root),
      flights: StdMutex::new(HashMap::new()),
    }
  }

  pub fn snapshots_dir(&self) -> &Path {
    &self.snapshots
  }

  pub fn staging_dir(&self) -> &Path {
    &self.staging
  }

  pub fn entry_path(&self, key: &Digest) -> PathBuf {
    self.snapshots.join(key.hex())
  }

  /// Find a committed, intact entry for `key`.
  ///
  /// Entries without a marker, or whose outputs no longer match the hashes in
  /// their marker, are reported as missing.
  pub fn lookup(&self, key: &Digest) -> Result<Option<CacheEntry>, CacheError> {
    let path = self.entry_path(key);
    let Some(marker) = read_marker(&path)? else {
      return Ok(None);
    };

    let outputs: Vec<PathBuf> = (0..marker.outputs.len())
      .map(|i| path.join(OUTPUTS_DIR).join(i.to_string()))
      .collect();

    for (output, expected) in outputs.iter().zip(&marker.outputs) {
      match hash_directory(output, &[]) {
        Ok(actual) if &actual == expected => {}
        Ok(actual) => {
          warn!(key = %key, path = ?output, expected = %expected, actual = %actual, "cache entry corrupted, will rebuild");
          return Ok(None);
        }
        Err(e) => {
          warn!(key = %key, path = ?output, error = %e, "failed to hash cache entry, will rebuild");
          return Ok(None);
        }
      }
    }

    Ok(Some(CacheEntry {
      key: key.clone(),
      path,
      outputs,
    }))
  }

  /// Create a fresh staging directory with `output_count` empty outputs.
  pub fn stage(&self, output_count: u32) -> Result<StagedEntry, CacheError> {
    fs::create_dir_all(&self.staging)?;
    let dir = tempfile::Builder::new().prefix("exec-").tempdir_in(&self.staging)?;
    let staged = StagedEntry { dir, output_count };
    fs::create_dir_all(staged.path().join(OUTPUTS_DIR))?;
    Ok(staged)
  }

  /// Write the marker into `staged` and move it into place under `key`.
  pub fn commit(&self, key: &Digest, staged: StagedEntry) -> Result<CacheEntry, CacheError> {
    remove_path(&staged.rootfs())?;

    let mut hashes = Vec::with_capacity(staged.output_count as usize);
    for index in 0..staged.output_count {
      let output = staged.output(index);
      fs::create_dir_all(&output)?;
      hashes.push(hash_directory(&output, &[])?);
    }

    let marker = CacheMarker {
      version: MARKER_VERSION,
      key: key.clone(),
      created_at: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
      outputs: hashes,
    };
    let content = serde_json::to_string(&marker)?;
    fs::write(staged.path().join(CACHE_COMPLETE_MARKER), format!("{}\n", content))?;

    fs::create_dir_all(&self.snapshots)?;
    let target = self.entry_path(key);
    let staged_path = staged.dir.keep();

    if let Err(e) = fs::rename(&staged_path, &target) {
      remove_path(&staged_path)?;
      // Another process may have committed the same key first.
      if let Some(entry) = self.lookup(key)? {
        debug!(key = %key, "entry committed concurrently, using existing");
        return Ok(entry);
      }
      return Err(e.into());
    }

    debug!(key = %key, path = ?target, "committed cache entry");
    self
      .lookup(key)?
      .ok_or_else(|| CacheError::Io(io::Error::other(format!("entry {} vanished after commit", key))))
  }

  /// Return the entry for `key`, computing it with `compute` on a miss.
  ///
  /// Concurrent callers for the same key are serialized: exactly one runs
  /// `compute`, the rest wait and observe its committed entry. The boolean is
  /// true on a cache hit.
  pub async fn get_or_compute<F, Fut, E>(
    &self,
    key: &Digest,
    output_count: u32,
    compute: F,
  ) -> Result<(CacheEntry, bool), E>
  where
    F: FnOnce(StagedEntry) -> Fut,
    Fut: Future<Output = Result<StagedEntry, E>>,
    E: From<CacheError>,
  {
    let flight = Flight::join(&self.flights, key);
    let _guard = flight.slot.lock().await;

    if let Some(entry) = self.lookup(key)? {
      return Ok((entry, true));
    }
    remove_path(&self.entry_path(key)).map_err(CacheError::from)?;

    let staged = self.stage(output_count)?;
    let staged = compute(staged).await?;
    Ok((self.commit(key, staged)?, false))
  }

  #[cfg(test)]
  fn flights_in_use(&self) -> usize {
    self.flights.lock().unwrap_or_else(PoisonError::into_inner).len()
  }
}

/// Read the completion marker of the entry at `path`, if any.
pub fn read_marker(path: &Path) -> Result<Option<CacheMarker>, CacheError> {
  match fs::read_to_string(path.join(CACHE_COMPLETE_MARKER)) {
    Ok(content) => match serde_json::from_str(&content) {
      Ok(marker) => Ok(Some(marker)),
      Err(e) => {
        debug!(path = ?path, error = %e, "invalid marker, treating entry as incomplete");
        Ok(None)
      }
    },
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
    Err(e) => Err(e.into()),
  }
}
