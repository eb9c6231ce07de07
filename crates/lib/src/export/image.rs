//! `image` exporter: pack the snapshot into the local image store.

use std::collections::BTreeMap;

use tracing::info;

use crate::image::{ImageStore, validate_name, validate_snapshotter};
use crate::solve::Snapshot;

use super::{ExportCause, ExportError, ExportResult, parse_bool};

pub const KIND: &str = "image";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageExporter {
  /// Every name the image is registered under. Never empty.
  pub names: Vec<String>,
  pub unpack: bool,
  pub snapshotter: String,
}

impl ImageExporter {
  /// Options: `name` (comma-separated, required), `unpack`, `snapshotter`
  /// and `push`. Pushing needs a registry client, so only `push=false` is
  /// accepted.
  pub fn from_options(options: &BTreeMap<String, String>, default_snapshotter: &str) -> Result<Self, ExportError> {
    let mut names = Vec::new();
    let mut unpack = false;
    let mut snapshotter = default_snapshotter.to_string();

    for (key, value) in options {
      match key.as_str() {
        "name" => {
          names = value
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect();
        }
        "unpack" => unpack = parse_bool(KIND, key, value)?,
        "snapshotter" => snapshotter = value.clone(),
        "push" => {
          if parse_bool(KIND, key, value)? {
            return Err(ExportError::invalid(KIND, "push is not supported without a registry"));
          }
        }
        other => return Err(ExportError::invalid(KIND, format!("unknown option {:?}", other))),
      }
    }

    if names.is_empty() {
      return Err(ExportError::invalid(KIND, "missing required option name"));
    }
    for name in &names {
      validate_name(name).map_err(|e| ExportError::invalid(KIND, e.to_string()))?;
    }
    validate_snapshotter(&snapshotter).map_err(|e| ExportError::invalid(KIND, e.to_string()))?;

    Ok(Self {
      names,
      unpack,
      snapshotter,
    })
  }

  pub fn export(&self, snapshot: &Snapshot, images: &ImageStore) -> Result<ExportResult, ExportCause> {
    let unpack = self.unpack.then_some(self.snapshotter.as_str());
    let record = images.put_snapshot_as(&self.names, &snapshot.path, unpack)?;

    info!(
      names = %self.names.join(","),
      digest = %record.digest(),
      unpacked = self.unpack,
      "exported image"
    );

    let attributes = BTreeMap::from([
      ("image.name".to_string(), self.names.join(",")),
      ("containerimage.digest".to_string(), record.digest().to_string()),
      ("containerimage.config.digest".to_string(), record.config_digest.to_string()),
      ("containerimage.size".to_string(), record.size.to_string()),
    ]);

    Ok(ExportResult {
      kind: KIND.to_string(),
      target: self.names.join(","),
      digest: record.digest().clone(),
      size: record.size,
      attributes,
    })
  }
}
