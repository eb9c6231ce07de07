//! Hashing utilities for content addressing and verification.
//!
//! This module provides:
//! - `Digest`: an algorithm-prefixed SHA-256 digest (`sha256:<hex>`)
//! - `Hashable`: digest of a value's canonical JSON form
//! - `hash_directory()`: Deterministic directory hashing
//! - `hash_file()`: Single file hashing
//! - `hash_bytes()`: Arbitrary byte hashing

use std::fmt;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use walkdir::WalkDir;

pub type HashError = serde_json::Error;

const SHA256_PREFIX: &str = "sha256:";

/// A content digest in OCI notation, e.g. `sha256:9f86d0...`.
///
/// Used for node digests, cache keys, image blobs and exported tree hashes alike.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Digest(String);

impl Digest {
  /// Wrap a finished SHA-256 hasher.
  pub fn from_hasher(hasher: Sha256) -> Self {
    Digest(format!("{}{}", SHA256_PREFIX, hex::encode(hasher.finalize())))
  }

  /// The hex part, without the algorithm prefix.
  pub fn hex(&self) -> &str {
    self.0.strip_prefix(SHA256_PREFIX).unwrap_or(&self.0)
  }

  /// First 12 hex characters, for log lines and progress output.
  pub fn short(&self) -> &str {
    let hex = self.hex();
    &hex[..hex.len().min(12)]
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for Digest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid digest {0:?}: expected sha256:<64 hex chars>")]
pub struct ParseDigestError(pub String);

impl FromStr for Digest {
  type Err = ParseDigestError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let hex = s.strip_prefix(SHA256_PREFIX).ok_or_else(|| ParseDigestError(s.to_string()))?;
    if hex.len() != 64 || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
      return Err(ParseDigestError(s.to_string()));
    }
    Ok(Digest(s.to_string()))
  }
}

/// Types whose digest is the SHA-256 of their JSON serialization.
///
/// Every map inside such a type must be a `BTreeMap` so the serialization is canonical.
pub trait Hashable: Serialize {
  fn compute_digest(&self) -> Result<Digest, HashError> {
    let serialized = serde_json::to_vec(self)?;
    Ok(hash_bytes(&serialized))
  }
}

/// Error during directory hashing.
#[derive(Debug, thiserror::Error)]
pub enum DirHashError {
  #[error("failed to walk directory: {message}")]
  WalkDir { message: String },

  #[error("failed to read file {path}: {message}")]
  ReadFile { path: String, message: String },

  #[error("failed to read symlink {path}: {message}")]
  ReadSymlink { path: String, message: String },
}

/// Compute a deterministic hash of a directory's contents.
///
/// The hash includes:
/// - File contents and the executable bit (not timestamps or ownership)
/// - Directory structure
/// - Symlink targets
///
/// Entries are sorted by path for determinism. Names listed in `exclude` are
/// skipped wherever they appear.
pub fn hash_directory(path: &Path, exclude: &[&str]) -> Result<Digest, DirHashError> {
  let mut entries: Vec<(String, String)> = Vec::new();

  let walker = WalkDir::new(path).sort_by_file_name().into_iter().filter_entry(|e| {
    e.file_name()
      .to_str()
      .map(|name| !exclude.contains(&name))
      .unwrap_or(true)
  });

  for entry in walker {
    let entry = entry.map_err(|e| DirHashError::WalkDir { message: e.to_string() })?;
    let entry_path = entry.path();

    let rel_path = entry_path
      .strip_prefix(path)
      .unwrap_or(entry_path)
      .to_string_lossy()
      .to_string();

    // Skip the root directory itself
    if rel_path.is_empty() {
      continue;
    }

    let file_type = entry.file_type();
    let entry_hash = if file_type.is_file() {
      let content_hash = hash_file(entry_path)?;
      let exec = if is_executable(&entry) { "x" } else { "-" };
      format!("F:{}:{}:{}", rel_path, exec, content_hash.hex())
    } else if file_type.is_dir() {
      format!("D:{}", rel_path)
    } else if file_type.is_symlink() {
      let target = fs::read_link(entry_path).map_err(|e| DirHashError::ReadSymlink {
        path: entry_path.display().to_string(),
        message: e.to_string(),
      })?;
      let target_hash = hash_bytes(target.to_string_lossy().as_bytes());
      format!("L:{}:{}", rel_path, target_hash.hex())
    } else {
      // Skip special files (sockets, devices, etc.)
      continue;
    };

    entries.push((rel_path, entry_hash));
  }

  entries.sort_by(|a, b| a.0.cmp(&b.0));

  let mut hasher = Sha256::new();
  for (_, entry_hash) in entries {
    hasher.update(entry_hash.as_bytes());
    hasher.update(b"\n");
  }

  Ok(Digest::from_hasher(hasher))
}

#[cfg(unix)]
fn is_executable(entry: &walkdir::DirEntry) -> bool {
  use std::os::unix::fs::PermissionsExt;
  entry
    .metadata()
    .map(|m| m.permissions().mode() & 0o111 != 0)
    .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_entry: &walkdir::DirEntry) -> bool {
  false
}

/// Hash a file's contents.
pub fn hash_file(path: &Path) -> Result<Digest, DirHashError> {
  let mut file = fs::File::open(path).map_err(|e| DirHashError::ReadFile {
    path: path.display().to_string(),
    message: e.to_string(),
  })?;

  let mut hasher = Sha256::new();
  let mut buffer = [0u8; 8192];

  loop {
    let bytes_read = file.read(&mut buffer).map_err(|e| DirHashError::ReadFile {
      path: path.display().to_string(),
      message: e.to_string(),
    })?;
    if bytes_read == 0 {
      break;
    }
    hasher.update(&buffer[..bytes_read]);
  }

  Ok(Digest::from_hasher(hasher))
}

/// Hash arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> Digest {
  let mut hasher = Sha256::new();
  hasher.update(data);
  Digest::from_hasher(hasher)
}

/// Hash a sequence of parts, length-prefixing each so boundaries are unambiguous.
pub fn hash_parts<'a>(parts: impl IntoIterator<Item = &'a str>) -> Digest {
  let mut hasher = Sha256::new();
  for part in parts {
    hasher.update((part.len() as u64).to_le_bytes());
    hasher.update(part.as_bytes());
  }
  Digest::from_hasher(hasher)
}
