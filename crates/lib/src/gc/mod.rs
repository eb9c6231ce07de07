use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use std::{fs, io};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::solve::cache::{SnapshotCache, read_marker};
use crate::util::fs::tree_size;

#[derive(Debug, Error)]
pub enum GcError {
  #[error("failed to read cache directory: {0}")]
  ReadCache(#[from] io::Error),

  #[error("failed to read marker of {path}: {message}")]
  Marker { path: PathBuf, message: String },
}

/// Retention limits. `None` means no limit of that kind.
#[derive(Debug, Clone, Default)]
pub struct PruneOptions {
  /// Entries created longer ago than this are removed.
  pub keep_duration: Option<Duration>,
  /// After age-based removal, drop oldest entries until the cache fits.
  pub keep_bytes: Option<u64>,
  pub dry_run: bool,
}

#[derive(Debug, Default, serde::Serialize)]
pub struct PruneStats {
  pub scanned: usize,
  pub deleted: usize,
  pub bytes_freed: u64,
  pub staging_cleared: usize,
}

#[derive(Debug, serde::Serialize)]
pub struct PruneResult {
  pub stats: PruneStats,
  pub deleted_paths: Vec<PathBuf>,
}

struct Candidate {
  path: PathBuf,
  created_at: Option<u64>,
  size: u64,
}

/// Evict snapshot cache entries.
///
/// Callers must hold the exclusive store lock: nothing may be building while
/// entries are removed. Incomplete entries and leftover staging directories
/// are always removed.
pub fn prune(cache: &SnapshotCache, options: &PruneOptions) -> Result<PruneResult, GcError> {
  let now = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs();

  let mut stats = PruneStats::default();
  let mut deleted_paths = Vec::new();

  let mut candidates = scan_entries(cache.snapshots_dir())?;
  stats.scanned = candidates.len();
  candidates.sort_by_key(|c| (c.created_at.unwrap_or(0), c.path.clone()));

  let cutoff = options.keep_duration.map(|d| now.saturating_sub(d.as_secs()));
  let mut kept = Vec::new();

  for candidate in candidates {
    let expired = match (candidate.created_at, cutoff) {
      (None, _) => {
        debug!(path = %candidate.path.display(), "removing incomplete cache entry");
        true
      }
      (Some(created_at), Some(cutoff)) => created_at < cutoff,
      (Some(_), None) => false,
    };

    if expired {
      delete(candidate, options.dry_run, &mut stats, &mut deleted_paths);
    } else {
      kept.push(candidate);
    }
  }

  if let Some(budget) = options.keep_bytes {
    let mut total: u64 = kept.iter().map(|c| c.size).sum();
    // Oldest first.
    for candidate in kept {
      if total <= budget {
        break;
      }
      total = total.saturating_sub(candidate.size);
      debug!(path = %candidate.path.display(), size = candidate.size, "evicting to fit storage budget");
      delete(candidate, options.dry_run, &mut stats, &mut deleted_paths);
    }
  }

  stats.staging_cleared = clear_staging(cache.staging_dir(), options.dry_run)?;

  info!(
    scanned = stats.scanned,
    deleted = stats.deleted,
    bytes_freed = stats.bytes_freed,
    dry_run = options.dry_run,
    "prune complete"
  );

  Ok(PruneResult { stats, deleted_paths })
}

fn scan_entries(dir: &Path) -> Result<Vec<Candidate>, GcError> {
  let entries = match fs::read_dir(dir) {
    Ok(entries) => entries,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
    Err(e) => return Err(e.into()),
  };

  let mut candidates = Vec::new();
  for entry in entries.flatten() {
    let path = entry.path();
    if !path.is_dir() {
      continue;
    }

    let marker = read_marker(&path).map_err(|e| GcError::Marker {
      path: path.clone(),
      message: e.to_string(),
    })?;
    let size = tree_size(&path).unwrap_or_else(|e| {
      warn!(path = %path.display(), error = %e, "failed to size cache entry");
      0
    });

    candidates.push(Candidate {
      path,
      created_at: marker.map(|m| m.created_at),
      size,
    });
  }

  Ok(candidates)
}

fn delete(candidate: Candidate, dry_run: bool, stats: &mut PruneStats, deleted_paths: &mut Vec<PathBuf>) {
  if !dry_run && let Err(e) = fs::remove_dir_all(&candidate.path) {
    warn!(path = %candidate.path.display(), error = %e, "failed to delete cache entry");
    return;
  }
  stats.deleted += 1;
  stats.bytes_freed += candidate.size;
  deleted_paths.push(candidate.path);
}

fn clear_staging(dir: &Path, dry_run: bool) -> Result<usize, GcError> {
  let entries = match fs::read_dir(dir) {
    Ok(entries) => entries,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
    Err(e) => return Err(e.into()),
  };

  let mut cleared = 0;
  for entry in entries.flatten() {
    let path = entry.path();
    debug!(path = %path.display(), "removing stale staging directory");
    if dry_run {
      cleared += 1;
      continue;
    }
    match crate::util::fs::remove_path(&path) {
      Ok(()) => cleared += 1,
      Err(e) => warn!(path = %path.display(), error = %e, "failed to delete staging directory"),
    }
  }
  Ok(cleared)
}
