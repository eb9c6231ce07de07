//! Filesystem helpers for snapshot trees.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use walkdir::WalkDir;

/// Recursively copy the contents of `src` into `dst`.
///
/// Relative paths, file bytes, permission bits and symlink targets are preserved.
/// Existing files in `dst` with the same relative path are overwritten; existing
/// directories are merged into.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
  fs::create_dir_all(dst)?;

  for entry in WalkDir::new(src).sort_by_file_name() {
    let entry = entry.map_err(io::Error::other)?;
    let rel = entry.path().strip_prefix(src).map_err(io::Error::other)?;
    if rel.as_os_str().is_empty() {
      continue;
    }
    let target = dst.join(rel);
    let file_type = entry.file_type();

    if file_type.is_dir() {
      fs::create_dir_all(&target)?;
      fs::set_permissions(&target, entry.metadata().map_err(io::Error::other)?.permissions())?;
    } else if file_type.is_symlink() {
      remove_path(&target)?;
      let link = fs::read_link(entry.path())?;
      symlink(&link, &target)?;
    } else if file_type.is_file() {
      // Never write through a link or onto a directory left at the target.
      if fs::symlink_metadata(&target).is_ok_and(|m| !m.is_file()) {
        remove_path(&target)?;
      }
      fs::copy(entry.path(), &target)?;
    }
  }

  Ok(())
}

/// Total size in bytes of regular files under `path`.
pub fn tree_size(path: &Path) -> io::Result<u64> {
  let mut total = 0;
  for entry in WalkDir::new(path) {
    let entry = entry.map_err(io::Error::other)?;
    if entry.file_type().is_file() {
      total += entry.metadata().map_err(io::Error::other)?.len();
    }
  }
  Ok(total)
}

/// Remove a file, symlink or directory tree. Missing paths are not an error.
pub fn remove_path(path: &Path) -> io::Result<()> {
  match fs::symlink_metadata(path) {
    Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
    Ok(_) => fs::remove_file(path),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(e),
  }
}

/// Write `contents` to `path` via a sibling temp file and rename.
///
/// Readers never observe a partially written file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
  let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
  fs::create_dir_all(parent)?;

  let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
  tmp.write_all(contents)?;
  tmp.as_file().sync_all()?;
  tmp.persist(path).map_err(|e| e.error)?;
  Ok(())
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
  std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
  if target.is_dir() {
    std::os::windows::fs::symlink_dir(target, link)
  } else {
    std::os::windows::fs::symlink_file(target, link)
  }
}
