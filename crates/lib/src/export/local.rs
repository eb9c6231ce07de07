//! `local` exporter: copy the snapshot tree to a directory on the host.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::solve::Snapshot;
use crate::util::fs::{copy_tree, tree_size};
use crate::util::hash::hash_directory;

use super::{ExportCause, ExportError, ExportResult};

pub const KIND: &str = "local";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalExporter {
  pub dest: PathBuf,
}

impl LocalExporter {
  /// Options: `dest` (or its alias `output`), required.
  pub fn from_options(options: &BTreeMap<String, String>) -> Result<Self, ExportError> {
    let mut dest = None;
    for (key, value) in options {
      match key.as_str() {
        "dest" | "output" => {
          if value.is_empty() {
            return Err(ExportError::invalid(KIND, format!("{} must not be empty", key)));
          }
          dest = Some(PathBuf::from(value));
        }
        other => return Err(ExportError::invalid(KIND, format!("unknown option {:?}", other))),
      }
    }

    let dest = dest.ok_or_else(|| ExportError::invalid(KIND, "missing required option dest"))?;
    Ok(Self { dest })
  }

  /// Replace the destination with the snapshot's tree.
  ///
  /// The tree is first copied next to the destination and then renamed into
  /// place, so a failed export never leaves a half-written directory.
  pub fn export(&self, snapshot: &Snapshot) -> Result<ExportResult, ExportCause> {
    let parent = self
      .dest
      .parent()
      .filter(|p| !p.as_os_str().is_empty())
      .unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;

    let staging = tempfile::Builder::new().prefix(".kiln-export-").tempdir_in(parent)?;
    copy_tree(&snapshot.path, staging.path())?;
    let digest = hash_directory(staging.path(), &[])?;
    let size = tree_size(staging.path())?;

    replace_dir(staging, &self.dest, parent)?;
    info!(dest = ?self.dest, digest = %digest, "exported to local directory");

    let dest = self.dest.display().to_string();
    let attributes = BTreeMap::from([
      ("local.dest".to_string(), dest.clone()),
      ("local.digest".to_string(), digest.to_string()),
      ("local.size".to_string(), size.to_string()),
    ]);

    Ok(ExportResult {
      kind: KIND.to_string(),
      target: dest,
      digest,
      size,
      attributes,
    })
  }
}

fn replace_dir(staging: tempfile::TempDir, dest: &Path, parent: &Path) -> io::Result<()> {
  match fs::symlink_metadata(dest) {
    Err(e) if e.kind() == io::ErrorKind::NotFound => {
      fs::rename(staging.keep(), dest)?;
      Ok(())
    }
    Err(e) => Err(e),
    Ok(meta) if !meta.is_dir() => Err(io::Error::new(
      io::ErrorKind::AlreadyExists,
      format!("{} exists and is not a directory", dest.display()),
    )),
    Ok(_) => {
      // Swap: old tree into a doomed temp dir, new tree into place.
      let trash = tempfile::Builder::new().prefix(".kiln-old-").tempdir_in(parent)?;
      let old = trash.path().join("old");
      fs::rename(dest, &old)?;
      if let Err(e) = fs::rename(staging.path(), dest) {
        debug!(dest = ?dest, error = %e, "restoring previous destination");
        fs::rename(&old, dest)?;
        return Err(e);
      }
      // The staged path is gone; keep the TempDir from trying to delete `dest`.
      let _ = staging.keep();
      Ok(())
    }
  }
}
