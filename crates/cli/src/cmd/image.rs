//! `kiln image` subcommands: import, ls and inspect.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde_json::json;

use kiln_lib::image::ImageStore;
use kiln_lib::platform::paths::images_dir;
use kiln_lib::store_lock::{LockMode, StoreLock};

use crate::output::{OutputFormat, format_bytes, print_info, print_json, print_stat, print_success, truncate_hash};

fn open_store(root: Option<PathBuf>) -> (PathBuf, ImageStore) {
  let config = super::engine_config(root);
  let store = ImageStore::open(images_dir(&config.root));
  (config.root, store)
}

/// Pack `dir` into an image named `name`. Used to seed base images.
pub fn cmd_image_import(name: &str, dir: &Path, root: Option<PathBuf>) -> Result<()> {
  if !dir.is_dir() {
    bail!("Not a directory: {}", dir.display());
  }

  let (root, store) = open_store(root);
  let _lock = StoreLock::acquire(&root, LockMode::Shared, "image import").context("Failed to acquire store lock")?;

  let record = store
    .put_snapshot(name, dir)
    .with_context(|| format!("Failed to import {}", dir.display()))?;

  print_success(&format!("Imported {}", record.name));
  print_stat("Digest", record.digest().as_str());
  print_stat("Size", &format_bytes(record.size));
  Ok(())
}

pub fn cmd_image_ls(format: OutputFormat, root: Option<PathBuf>) -> Result<()> {
  let (_, store) = open_store(root);
  let images = store.list().context("Failed to read image index")?;

  if format.is_json() {
    return print_json(&images);
  }

  if images.is_empty() {
    print_info("No images");
    return Ok(());
  }

  let width = images.iter().map(|i| i.name.len()).max().unwrap_or(4).max(4);
  println!("{:<width$}  {:<12}  {:>10}  UNPACKED", "NAME", "DIGEST", "SIZE", width = width);
  for image in &images {
    let unpacked: Vec<&str> = image.unpacked.keys().map(String::as_str).collect();
    println!(
      "{:<width$}  {:<12}  {:>10}  {}",
      image.name,
      truncate_hash(image.digest().as_str()),
      format_bytes(image.size),
      unpacked.join(","),
      width = width
    );
  }
  Ok(())
}

pub fn cmd_image_inspect(name: &str, snapshotter: Option<&str>, root: Option<PathBuf>) -> Result<()> {
  let (_, store) = open_store(root);
  let record = store.resolve(name)?;
  let manifest = store.manifest(&record)?;

  let mut value = json!({
    "name": record.name,
    "digest": record.digest(),
    "config_digest": record.config_digest,
    "size": record.size,
    "created_at": record.created_at,
    "layers": manifest.layers,
    "unpacked": record.unpacked,
  });
  if let Some(snapshotter) = snapshotter {
    value["snapshotter"] = json!(snapshotter);
    value["is_unpacked"] = json!(record.is_unpacked(snapshotter));
  }

  print_json(&value)
}
