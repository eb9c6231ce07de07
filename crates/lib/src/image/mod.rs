//! Content-addressed image store.
//!
//! Images live in an OCI-style layout under the state root:
//!
//! ```text
//! images/
//! ├── blobs/sha256/<hex>            # layers, configs and manifests
//! ├── index.json                    # image name -> ImageRecord
//! └── snapshotters/<name>/<chain>/  # unpacked, ready-to-run filesystems
//! ```
//!
//! An image's digest is its manifest digest. Packing is deterministic, so
//! storing the same tree twice yields the same digest.
//!
//! Every change to `index.json` is a read-modify-write under an exclusive
//! lock on `.index.lock`, so concurrent processes never drop each other's
//! updates. Readers need no lock: the index is replaced atomically.
//!
//! # Submodules
//!
//! - [`layer`] - deterministic tar+gzip layers
//! - [`oci`] - config and manifest documents

pub mod layer;
pub mod oci;

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::store_lock::FileLock;
use crate::util::fs::{remove_path, write_atomic};
use crate::util::hash::{Digest, hash_bytes};

use oci::{Descriptor, ImageConfig, MEDIA_TYPE_CONFIG, MEDIA_TYPE_LAYER, MEDIA_TYPE_MANIFEST, Manifest};

const INDEX_FILENAME: &str = "index.json";
const INDEX_LOCK_FILENAME: &str = ".index.lock";

#[derive(Debug, Error)]
pub enum ImageError {
  #[error("image not found: {0}")]
  NotFound(String),

  #[error("invalid image name {0:?}")]
  InvalidName(String),

  #[error("invalid snapshotter name {0:?}")]
  InvalidSnapshotter(String),

  #[error("blob {digest} is corrupt: {message}")]
  Corrupt { digest: Digest, message: String },

  #[error("io error: {0}")]
  Io(#[from] io::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),
}

/// A named image as recorded in the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
  pub name: String,
  /// The manifest descriptor. Its digest is the image digest.
  pub target: Descriptor,
  pub config_digest: Digest,
  /// Total size of manifest, config and layer blobs.
  pub size: u64,
  pub created_at: u64,
  /// Snapshotter name -> chain id of the unpacked filesystem.
  #[serde(default)]
  pub unpacked: BTreeMap<String, String>,
}

impl ImageRecord {
  pub fn digest(&self) -> &Digest {
    &self.target.digest
  }

  pub fn is_unpacked(&self, snapshotter: &str) -> bool {
    self.unpacked.contains_key(snapshotter)
  }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ImageIndex {
  #[serde(default)]
  images: BTreeMap<String, ImageRecord>,
}

#[derive(Debug)]
pub struct ImageStore {
  root: PathBuf,
}

impl ImageStore {
  /// Open (without creating) the store rooted at `root`.
  pub fn open(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Pack `dir` into an image and register it under `name`.
  ///
  /// Re-registering identical content keeps the existing unpack state.
  pub fn put_snapshot(&self, name: &str, dir: &Path) -> Result<ImageRecord, ImageError> {
    self.put_snapshot_as(&[name.to_string()], dir, None)
  }

  /// Pack `dir` once and register it under every name in `names`.
  ///
  /// All names are validated before anything is written, and they are
  /// registered in a single index update: either every name points at the
  /// new image or none does. With `unpack`, the filesystem for that
  /// snapshotter is materialized first and recorded on every name. Returns
  /// the record of the first name.
  pub fn put_snapshot_as(&self, names: &[String], dir: &Path, unpack: Option<&str>) -> Result<ImageRecord, ImageError> {
    let Some(first) = names.first() else {
      return Err(ImageError::InvalidName(String::new()));
    };
    for name in names {
      validate_name(name)?;
    }
    if let Some(snapshotter) = unpack {
      validate_snapshotter(snapshotter)?;
    }

    let layer = layer::pack(dir)?;
    let layer_desc = self.write_blob(MEDIA_TYPE_LAYER, &layer.blob)?;
    debug!(layer = %layer_desc.digest, diff_id = %layer.diff_id, "wrote layer blob");

    let config = ImageConfig::for_layers(vec![layer.diff_id]);
    let config_desc = self.write_blob(MEDIA_TYPE_CONFIG, &serde_json::to_vec(&config)?)?;

    let manifest = Manifest::new(config_desc.clone(), vec![layer_desc.clone()]);
    let manifest_desc = self.write_blob(MEDIA_TYPE_MANIFEST, &serde_json::to_vec(&manifest)?)?;

    let mut unpacked = BTreeMap::new();
    if let Some(snapshotter) = unpack {
      let chain_id = self.materialize(&manifest, snapshotter)?;
      unpacked.insert(snapshotter.to_string(), chain_id.to_string());
    }

    let template = ImageRecord {
      name: String::new(),
      size: manifest_desc.size + config_desc.size + layer_desc.size,
      target: manifest_desc,
      config_digest: config_desc.digest,
      created_at: now_unix(),
      unpacked,
    };

    let mut records = self.register(names.iter().map(|name| ImageRecord {
      name: name.clone(),
      ..template.clone()
    }))?;
    let record = records.swap_remove(0);
    info!(name = %first, names = names.len(), digest = %record.digest(), "stored image");
    Ok(record)
  }

  /// Register an existing image under another name.
  pub fn tag(&self, source: &ImageRecord, name: &str) -> Result<ImageRecord, ImageError> {
    validate_name(name)?;
    let record = ImageRecord {
      name: name.to_string(),
      created_at: now_unix(),
      unpacked: BTreeMap::new(),
      ..source.clone()
    };
    let mut records = self.register([record])?;
    Ok(records.swap_remove(0))
  }

  pub fn get(&self, name: &str) -> Result<Option<ImageRecord>, ImageError> {
    Ok(self.load_index()?.images.remove(name))
  }

  /// Like [`ImageStore::get`], but a missing image is an error.
  pub fn resolve(&self, name: &str) -> Result<ImageRecord, ImageError> {
    self.get(name)?.ok_or_else(|| ImageError::NotFound(name.to_string()))
  }

  pub fn list(&self) -> Result<Vec<ImageRecord>, ImageError> {
    Ok(self.load_index()?.images.into_values().collect())
  }

  pub fn manifest(&self, record: &ImageRecord) -> Result<Manifest, ImageError> {
    let bytes = self.read_blob(&record.target.digest)?;
    Ok(serde_json::from_slice(&bytes)?)
  }

  pub fn config(&self, manifest: &Manifest) -> Result<ImageConfig, ImageError> {
    let bytes = self.read_blob(&manifest.config.digest)?;
    Ok(serde_json::from_slice(&bytes)?)
  }

  /// Materialize `name` as a ready-to-run filesystem for `snapshotter` and
  /// record it in the index.
  pub fn unpack(&self, name: &str, snapshotter: &str) -> Result<ImageRecord, ImageError> {
    validate_snapshotter(snapshotter)?;

    let record = self.resolve(name)?;
    let manifest = self.manifest(&record)?;
    let chain_id = self.materialize(&manifest, snapshotter)?;

    let updated = self.update_index(|index| {
      let entry = index
        .images
        .get_mut(name)
        .filter(|entry| entry.target.digest == record.target.digest)
        .ok_or_else(|| ImageError::NotFound(name.to_string()))?;
      entry.unpacked.insert(snapshotter.to_string(), chain_id.to_string());
      Ok(entry.clone())
    })?;

    info!(name, snapshotter, "image unpacked");
    Ok(updated)
  }

  /// Unpack the layers of `manifest` into the snapshotter directory for its
  /// chain id, unless already there.
  fn materialize(&self, manifest: &Manifest, snapshotter: &str) -> Result<Digest, ImageError> {
    let config = self.config(manifest)?;
    let chain_id = config.chain_id().ok_or_else(|| ImageError::Corrupt {
      digest: manifest.config.digest.clone(),
      message: "image has no layers".to_string(),
    })?;

    let snapshot_dir = self.snapshot_path(snapshotter, &chain_id);
    if snapshot_dir.exists() {
      return Ok(chain_id);
    }

    let parent = self.root.join("snapshotters").join(snapshotter);
    fs::create_dir_all(&parent)?;
    let staging = tempfile::Builder::new().prefix(".unpack-").tempdir_in(&parent)?;
    for layer in &manifest.layers {
      layer::unpack(&self.read_blob(&layer.digest)?, staging.path())?;
    }
    let staged = staging.keep();
    if let Err(e) = fs::rename(&staged, &snapshot_dir) {
      // Someone else unpacked the same chain first.
      remove_path(&staged)?;
      if !snapshot_dir.exists() {
        return Err(e.into());
      }
    }
    debug!(snapshotter, chain_id = %chain_id, "materialized snapshot");
    Ok(chain_id)
  }

  /// Apply every layer of `record` onto `dest`.
  pub fn extract(&self, record: &ImageRecord, dest: &Path) -> Result<(), ImageError> {
    let manifest = self.manifest(record)?;
    fs::create_dir_all(dest)?;
    for layer in &manifest.layers {
      layer::unpack(&self.read_blob(&layer.digest)?, dest)?;
    }
    Ok(())
  }

  /// Directory holding the unpacked filesystem for `chain_id`.
  pub fn snapshot_path(&self, snapshotter: &str, chain_id: &Digest) -> PathBuf {
    self.root.join("snapshotters").join(snapshotter).join(chain_id.hex())
  }

  fn blob_path(&self, digest: &Digest) -> PathBuf {
    self.root.join("blobs").join("sha256").join(digest.hex())
  }

  fn write_blob(&self, media_type: &str, bytes: &[u8]) -> Result<Descriptor, ImageError> {
    let digest = hash_bytes(bytes);
    let path = self.blob_path(&digest);
    if !path.exists() {
      write_atomic(&path, bytes)?;
    }
    Ok(Descriptor {
      media_type: media_type.to_string(),
      digest,
      size: bytes.len() as u64,
    })
  }

  fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>, ImageError> {
    let bytes = fs::read(self.blob_path(digest))?;
    let actual = hash_bytes(&bytes);
    if &actual != digest {
      return Err(ImageError::Corrupt {
        digest: digest.clone(),
        message: format!("content hashes to {}", actual),
      });
    }
    Ok(bytes)
  }

  /// Insert `records` in one index update. A name that already points at
  /// the same image keeps the snapshotters it was unpacked for.
  fn register(&self, records: impl IntoIterator<Item = ImageRecord>) -> Result<Vec<ImageRecord>, ImageError> {
    self.update_index(|index| {
      let mut registered = Vec::new();
      for mut record in records {
        if let Some(existing) = index.images.get(&record.name)
          && existing.target.digest == record.target.digest
        {
          for (snapshotter, chain) in &existing.unpacked {
            record.unpacked.entry(snapshotter.clone()).or_insert_with(|| chain.clone());
          }
        }
        index.images.insert(record.name.clone(), record.clone());
        registered.push(record);
      }
      Ok(registered)
    })
  }

  /// Run `apply` against the current index and save the result, holding the
  /// index lock throughout. Nothing is saved when `apply` fails.
  fn update_index<T>(&self, apply: impl FnOnce(&mut ImageIndex) -> Result<T, ImageError>) -> Result<T, ImageError> {
    let _lock = FileLock::exclusive(&self.root.join(INDEX_LOCK_FILENAME))?;
    let mut index = self.load_index()?;
    let value = apply(&mut index)?;
    self.save_index(&index)?;
    Ok(value)
  }

  fn load_index(&self) -> Result<ImageIndex, ImageError> {
    match fs::read(self.root.join(INDEX_FILENAME)) {
      Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(ImageIndex::default()),
      Err(e) => Err(e.into()),
    }
  }

  fn save_index(&self, index: &ImageIndex) -> Result<(), ImageError> {
    let bytes = serde_json::to_vec_pretty(index)?;
    write_atomic(&self.root.join(INDEX_FILENAME), &bytes)?;
    Ok(())
  }
}

/// Image names are non-empty and contain no commas or whitespace.
pub fn validate_name(name: &str) -> Result<(), ImageError> {
  if name.is_empty() || name.contains(',') || name.chars().any(char::is_whitespace) {
    return Err(ImageError::InvalidName(name.to_string()));
  }
  Ok(())
}

pub fn validate_snapshotter(name: &str) -> Result<(), ImageError> {
  let valid = !name.is_empty()
    && name != "."
    && name != ".."
    && name
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
  if valid {
    Ok(())
  } else {
    Err(ImageError::InvalidSnapshotter(name.to_string()))
  }
}

fn now_unix() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::hash::hash_directory;
  use tempfile::{TempDir, tempdir};

  fn store() -> (TempDir, ImageStore) {
    let temp = tempdir().unwrap();
    let store = ImageStore::open(temp.path().join("images"));
    (temp, store)
  }

  fn tree(contents: &[u8]) -> TempDir {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("foo"), contents).unwrap();
    dir
  }

  #[test]
  fn put_and_get() {
    let (_temp, store) = store();
    let src = tree(b"bar");

    let record = store.put_snapshot("example.com/x:test", src.path()).unwrap();
    let fetched = store.get("example.com/x:test").unwrap().unwrap();

    assert_eq!(record.digest(), fetched.digest());
    assert!(fetched.size > 0);
    assert!(!fetched.is_unpacked("overlayfs"));
  }

  #[test]
  fn identical_content_gives_identical_digest() {
    let (_temp, store) = store();
    let a = store.put_snapshot("a", tree(b"bar").path()).unwrap();
    let b = store.put_snapshot("b", tree(b"bar").path()).unwrap();
    let c = store.put_snapshot("c", tree(b"baz").path()).unwrap();

    assert_eq!(a.digest(), b.digest());
    assert_ne!(a.digest(), c.digest());
  }

  #[test]
  fn missing_image_is_not_found() {
    let (_temp, store) = store();
    assert!(store.get("nope").unwrap().is_none());
    assert!(matches!(store.resolve("nope"), Err(ImageError::NotFound(_))));
  }

  #[test]
  fn unpack_marks_snapshotter_and_materializes_tree() {
    let (_temp, store) = store();
    let src = tree(b"bar");
    store.put_snapshot("img", src.path()).unwrap();

    let record = store.unpack("img", "overlayfs").unwrap();
    assert!(record.is_unpacked("overlayfs"));
    assert!(!record.is_unpacked("native"));
    assert!(store.get("img").unwrap().unwrap().is_unpacked("overlayfs"));

    let chain: Digest = record.unpacked["overlayfs"].parse().unwrap();
    let dir = store.snapshot_path("overlayfs", &chain);
    assert_eq!(hash_directory(&dir, &[]).unwrap(), hash_directory(src.path(), &[]).unwrap());
  }

  #[test]
  fn reputting_same_content_keeps_unpack_state() {
    let (_temp, store) = store();
    let src = tree(b"bar");
    store.put_snapshot("img", src.path()).unwrap();
    store.unpack("img", "overlayfs").unwrap();

    let again = store.put_snapshot("img", src.path()).unwrap();
    assert!(again.is_unpacked("overlayfs"));

    let changed = store.put_snapshot("img", tree(b"other").path()).unwrap();
    assert!(!changed.is_unpacked("overlayfs"));
  }

  #[test]
  fn extract_applies_layers() {
    let (_temp, store) = store();
    let record = store.put_snapshot("img", tree(b"bar").path()).unwrap();

    let dest = tempdir().unwrap();
    store.extract(&record, dest.path()).unwrap();
    assert_eq!(fs::read(dest.path().join("foo")).unwrap(), b"bar");
  }

  #[test]
  fn tag_shares_digest() {
    let (_temp, store) = store();
    let record = store.put_snapshot("one", tree(b"bar").path()).unwrap();
    let tagged = store.tag(&record, "two").unwrap();

    assert_eq!(tagged.digest(), record.digest());
    assert_eq!(store.list().unwrap().len(), 2);
  }

  #[test]
  fn corrupt_blob_is_detected() {
    let (_temp, store) = store();
    let record = store.put_snapshot("img", tree(b"bar").path()).unwrap();
    fs::write(store.blob_path(record.digest()), b"garbage").unwrap();

    assert!(matches!(store.manifest(&record), Err(ImageError::Corrupt { .. })));
  }

  #[test]
  fn names_and_snapshotters_are_validated() {
    let (_temp, store) = store();
    let src = tree(b"bar");
    assert!(matches!(store.put_snapshot("", src.path()), Err(ImageError::InvalidName(_))));
    assert!(matches!(store.put_snapshot("a,b", src.path()), Err(ImageError::InvalidName(_))));

    store.put_snapshot("img", src.path()).unwrap();
    assert!(matches!(
      store.unpack("img", "../escape"),
      Err(ImageError::InvalidSnapshotter(_))
    ));
  }

  #[test]
  fn put_snapshot_as_registers_all_names_or_none() {
    let (_temp, store) = store();
    let src = tree(b"bar");

    let names = vec!["example.com/a:1".to_string(), "bad name".to_string()];
    assert!(matches!(
      store.put_snapshot_as(&names, src.path(), None),
      Err(ImageError::InvalidName(_))
    ));
    assert!(store.list().unwrap().is_empty());

    let names = vec!["example.com/a:1".to_string(), "example.com/b:1".to_string()];
    let record = store.put_snapshot_as(&names, src.path(), Some("overlayfs")).unwrap();
    assert_eq!(record.name, "example.com/a:1");
    for name in &names {
      let stored = store.resolve(name).unwrap();
      assert_eq!(stored.digest(), record.digest());
      assert!(stored.is_unpacked("overlayfs"));
    }
  }

  #[test]
  fn concurrent_handles_keep_every_update() {
    let temp = tempdir().unwrap();
    let root = temp.path().join("images");
    let src = tree(b"bar");

    let writers: Vec<_> = (0..8)
      .map(|i| {
        let root = root.clone();
        let src = src.path().to_path_buf();
        std::thread::spawn(move || {
          let store = ImageStore::open(root);
          store.put_snapshot(&format!("example.com/img:{}", i), &src).unwrap();
          store.unpack(&format!("example.com/img:{}", i), "overlayfs").unwrap();
        })
      })
      .collect();
    for writer in writers {
      writer.join().unwrap();
    }

    let records = ImageStore::open(&root).list().unwrap();
    assert_eq!(records.len(), 8);
    assert!(records.iter().all(|r| r.is_unpacked("overlayfs")));
  }
}
