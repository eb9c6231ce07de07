//! Deterministic filesystem layers.
//!
//! A layer is a gzip'd tar of a directory tree. Entries are written in sorted
//! order with fixed ownership and timestamps, and the gzip header carries no
//! mtime, so packing the same tree twice yields the same blob digest.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use flate2::Compression;
use flate2::GzBuilder;
use flate2::read::GzDecoder;
use tar::{Archive, Builder, EntryType, Header};
use walkdir::WalkDir;

use crate::consts::SOURCE_DATE_EPOCH;
use crate::util::hash::{Digest, hash_bytes};

/// A packed layer blob plus its two digests.
#[derive(Debug)]
pub struct PackedLayer {
  /// Compressed bytes, as stored in the blob store.
  pub blob: Vec<u8>,
  /// Digest of `blob`.
  pub digest: Digest,
  /// Digest of the uncompressed tar (the OCI diff id).
  pub diff_id: Digest,
}

pub fn pack(dir: &Path) -> io::Result<PackedLayer> {
  let mut builder = Builder::new(Vec::new());
  builder.follow_symlinks(false);

  for entry in WalkDir::new(dir).sort_by_file_name() {
    let entry = entry.map_err(io::Error::other)?;
    let rel = entry.path().strip_prefix(dir).map_err(io::Error::other)?;
    if rel.as_os_str().is_empty() {
      continue;
    }
    let meta = entry.path().symlink_metadata()?;

    let mut header = Header::new_gnu();
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(SOURCE_DATE_EPOCH);
    header.set_mode(entry_mode(&meta));

    let file_type = meta.file_type();
    if file_type.is_dir() {
      header.set_entry_type(EntryType::Directory);
      header.set_size(0);
      builder.append_data(&mut header, rel, io::empty())?;
    } else if file_type.is_symlink() {
      header.set_entry_type(EntryType::Symlink);
      header.set_size(0);
      let target = fs::read_link(entry.path())?;
      builder.append_link(&mut header, rel, target)?;
    } else if file_type.is_file() {
      header.set_entry_type(EntryType::Regular);
      header.set_size(meta.len());
      builder.append_data(&mut header, rel, File::open(entry.path())?)?;
    }
  }

  let tar = builder.into_inner()?;
  let diff_id = hash_bytes(&tar);

  let mut encoder = GzBuilder::new().mtime(0).write(Vec::new(), Compression::default());
  encoder.write_all(&tar)?;
  let blob = encoder.finish()?;
  let digest = hash_bytes(&blob);

  Ok(PackedLayer { blob, digest, diff_id })
}

/// Apply a packed layer on top of `dest`.
pub fn unpack(blob: &[u8], dest: &Path) -> io::Result<()> {
  fs::create_dir_all(dest)?;

  let mut archive = Archive::new(GzDecoder::new(blob));
  archive.set_preserve_permissions(true);
  archive.set_unpack_xattrs(false);
  archive.set_overwrite(true);
  archive.unpack(dest)
}

#[cfg(unix)]
fn entry_mode(meta: &fs::Metadata) -> u32 {
  use std::os::unix::fs::PermissionsExt;
  meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn entry_mode(meta: &fs::Metadata) -> u32 {
  if meta.is_dir() { 0o755 } else { 0o644 }
}
