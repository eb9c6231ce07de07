//! Build metadata record.
//!
//! A flat `key -> value` map folded from every export result and written once
//! per successful build as a single JSON object.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::export::ExportResult;
use crate::util::fs::write_atomic;

#[derive(Debug, Error)]
pub enum MetadataError {
  #[error("failed to write metadata file: {0}")]
  Io(#[from] io::Error),

  #[error("failed to serialize metadata: {0}")]
  Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataRecord(BTreeMap<String, String>);

impl MetadataRecord {
  pub fn new() -> Self {
    Self::default()
  }

  /// Insert a key.
  ///
  /// A key reported again with a new value keeps both, comma-separated in
  /// insertion order, the same way a multi-name image export reports
  /// `image.name`. Values already present are not repeated.
  pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
    let value = value.into();
    match self.0.entry(key.into()) {
      Entry::Vacant(slot) => {
        slot.insert(value);
      }
      Entry::Occupied(mut slot) => {
        let existing = slot.get_mut();
        for part in value.split(',') {
          if !existing.split(',').any(|seen| seen == part) {
            existing.push(',');
            existing.push_str(part);
          }
        }
      }
    }
  }

  /// Fold export results in request order.
  pub fn from_results(results: &[ExportResult]) -> Self {
    let mut record = Self::new();
    for result in results {
      for (key, value) in &result.attributes {
        record.insert(key.clone(), value.clone());
      }
    }
    record
  }

  pub fn get(&self, key: &str) -> Option<&str> {
    self.0.get(key).map(String::as_str)
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn entries(&self) -> &BTreeMap<String, String> {
    &self.0
  }

  pub fn to_json(&self) -> Result<Vec<u8>, MetadataError> {
    Ok(serde_json::to_vec_pretty(self)?)
  }

  /// Serialize fully in memory, then place the file atomically.
  pub fn write(&self, path: &Path) -> Result<(), MetadataError> {
    let json = self.to_json()?;
    write_atomic(path, &json)?;
    info!(path = ?path, keys = self.0.len(), "wrote metadata file");
    Ok(())
  }
}
