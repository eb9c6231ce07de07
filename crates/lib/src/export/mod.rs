//! Exporters: deliver a solved snapshot somewhere outside the cache.
//!
//! A build may request several exports of the same root. They run
//! concurrently and are reported in request order. Under
//! [`ExportPolicy::Isolated`] one exporter failing never affects another;
//! under [`ExportPolicy::FailFast`] the first failure aborts the ones that
//! have not started yet.
//!
//! # Submodules
//!
//! - [`local`] - copy to a host directory
//! - [`image`] - pack into the image store

pub mod image;
pub mod local;

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::image::{ImageError, ImageStore};
use crate::progress::{ProgressBus, ProgressEvent};
use crate::solve::Snapshot;
use crate::util::hash::{DirHashError, Digest};

pub use image::ImageExporter;
pub use local::LocalExporter;

#[derive(Debug, Error)]
pub enum ExportError {
  #[error("invalid {kind} exporter config: {message}")]
  InvalidConfig { kind: String, message: String },

  #[error("{kind} export failed: {cause}")]
  Failed {
    kind: String,
    #[source]
    cause: ExportCause,
  },

  #[error("{kind} export cancelled")]
  Cancelled { kind: String },
}

impl ExportError {
  pub(crate) fn invalid(kind: &str, message: impl Into<String>) -> Self {
    ExportError::InvalidConfig {
      kind: kind.to_string(),
      message: message.into(),
    }
  }

  pub fn kind(&self) -> &str {
    match self {
      ExportError::InvalidConfig { kind, .. } | ExportError::Failed { kind, .. } | ExportError::Cancelled { kind } => {
        kind
      }
    }
  }
}

#[derive(Debug, Error)]
pub enum ExportCause {
  #[error(transparent)]
  Io(#[from] io::Error),

  #[error(transparent)]
  Image(#[from] ImageError),

  #[error(transparent)]
  Hash(#[from] DirHashError),

  #[error("export task panicked: {0}")]
  Panicked(String),
}

/// How exporter failures interact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExportPolicy {
  #[default]
  Isolated,
  FailFast,
}

/// Exporter kind plus its raw `key=value` options, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportConfig {
  pub kind: String,
  pub options: BTreeMap<String, String>,
}

impl ExportConfig {
  pub fn new(kind: impl Into<String>) -> Self {
    Self {
      kind: kind.into(),
      options: BTreeMap::new(),
    }
  }

  pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.options.insert(key.into(), value.into());
    self
  }

  /// Build from an exporter kind and a list of `key=value` strings.
  pub fn from_legacy<S: AsRef<str>>(kind: &str, opts: &[S]) -> Result<Self, ExportError> {
    let mut config = ExportConfig::new(kind);
    for opt in opts {
      let (key, value) = split_pair(kind, opt.as_ref())?;
      config.options.insert(key, value);
    }
    Ok(config)
  }

  /// Parse the CSV form, such as `type=image,name=example.com/a:1,push=false`.
  ///
  /// Fields may be double-quoted to carry commas, e.g. `"name=a,b"`.
  pub fn parse_csv(csv: &str) -> Result<Self, ExportError> {
    let mut kind = None;
    let mut options = BTreeMap::new();

    for field in split_csv(csv)? {
      if field.is_empty() {
        continue;
      }
      let (key, value) = split_pair("output", &field)?;
      if key == "type" {
        kind = Some(value);
      } else {
        options.insert(key, value);
      }
    }

    let kind = kind.ok_or_else(|| ExportError::invalid("output", format!("missing type= in {:?}", csv)))?;
    Ok(Self { kind, options })
  }
}

impl FromStr for ExportConfig {
  type Err = ExportError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    ExportConfig::parse_csv(s)
  }
}

fn split_pair(kind: &str, pair: &str) -> Result<(String, String), ExportError> {
  match pair.split_once('=') {
    Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.to_string())),
    _ => Err(ExportError::invalid(kind, format!("expected key=value, got {:?}", pair))),
  }
}

fn split_csv(csv: &str) -> Result<Vec<String>, ExportError> {
  let mut fields = Vec::new();
  let mut current = String::new();
  let mut quoted = false;

  for c in csv.chars() {
    match c {
      '"' => quoted = !quoted,
      ',' if !quoted => fields.push(std::mem::take(&mut current)),
      c => current.push(c),
    }
  }
  if quoted {
    return Err(ExportError::invalid("output", format!("unterminated quote in {:?}", csv)));
  }
  fields.push(current);
  Ok(fields)
}

/// Boolean option values, in the spellings Go's `strconv.ParseBool` accepts.
pub(crate) fn parse_bool(kind: &str, key: &str, value: &str) -> Result<bool, ExportError> {
  match value {
    "" | "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
    "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
    other => Err(ExportError::invalid(kind, format!("{} expects a boolean, got {:?}", key, other))),
  }
}

/// A validated exporter, ready to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exporter {
  Local(LocalExporter),
  Image(ImageExporter),
}

impl Exporter {
  /// Validate a config. Called before solving so bad options fail fast.
  pub fn from_config(config: &ExportConfig, default_snapshotter: &str) -> Result<Self, ExportError> {
    match config.kind.as_str() {
      local::KIND => Ok(Exporter::Local(LocalExporter::from_options(&config.options)?)),
      image::KIND => Ok(Exporter::Image(ImageExporter::from_options(
        &config.options,
        default_snapshotter,
      )?)),
      other => Err(ExportError::invalid(other, "unknown exporter type")),
    }
  }

  pub fn kind(&self) -> &'static str {
    match self {
      Exporter::Local(_) => local::KIND,
      Exporter::Image(_) => image::KIND,
    }
  }

  pub fn export(&self, snapshot: &Snapshot, images: &ImageStore) -> Result<ExportResult, ExportError> {
    let result = match self {
      Exporter::Local(exporter) => exporter.export(snapshot),
      Exporter::Image(exporter) => exporter.export(snapshot, images),
    };
    result.map_err(|cause| ExportError::Failed {
      kind: self.kind().to_string(),
      cause,
    })
  }
}

/// What one exporter produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportResult {
  pub kind: String,
  /// Destination directory or image name(s).
  pub target: String,
  pub digest: Digest,
  pub size: u64,
  /// Flat attributes folded into the build metadata record.
  pub attributes: BTreeMap<String, String>,
}

/// Run every exporter against `snapshot`.
///
/// Returns all results in request order, or every error in request order if
/// any exporter failed.
pub async fn run_exports(
  exporters: Vec<Exporter>,
  snapshot: &Snapshot,
  images: Arc<ImageStore>,
  policy: ExportPolicy,
  progress: &ProgressBus,
  cancel: &CancelToken,
) -> Result<Vec<ExportResult>, Vec<ExportError>> {
  let mut join_set = JoinSet::new();
  let mut positions = HashMap::new();

  for (position, exporter) in exporters.into_iter().enumerate() {
    let kind = exporter.kind();
    progress.publish(ProgressEvent::ExportStarted { kind: kind.to_string() });

    let snapshot = snapshot.clone();
    let images = Arc::clone(&images);
    let handle = join_set.spawn_blocking(move || exporter.export(&snapshot, &images));
    positions.insert(handle.id(), (position, kind));
  }

  let mut results = Vec::new();
  let mut errors = Vec::new();

  loop {
    let next = tokio::select! {
      biased;
      _ = cancel.cancelled() => {
        warn!("export cancelled");
        join_set.abort_all();
        // Blocking exports that already started run to completion.
        while join_set.join_next().await.is_some() {}
        return Err(vec![ExportError::Cancelled { kind: "all".to_string() }]);
      }
      next = join_set.join_next_with_id() => next,
    };

    let Some(joined) = next else {
      break;
    };

    let (id, outcome) = match joined {
      Ok((id, outcome)) => (id, outcome),
      Err(join_error) => {
        let id = join_error.id();
        if join_error.is_cancelled() {
          if let Some((position, kind)) = positions.get(&id) {
            debug!(kind, position, "export aborted before it started");
          }
          continue;
        }
        let kind = positions.get(&id).map(|(_, kind)| *kind).unwrap_or("unknown");
        (
          id,
          Err(ExportError::Failed {
            kind: kind.to_string(),
            cause: ExportCause::Panicked(join_error.to_string()),
          }),
        )
      }
    };

    let Some(&(position, kind)) = positions.get(&id) else {
      continue;
    };

    match outcome {
      Ok(result) => {
        progress.publish(ProgressEvent::ExportCompleted { kind: kind.to_string() });
        results.push((position, result));
      }
      Err(e) => {
        warn!(kind, error = %e, "export failed");
        progress.publish(ProgressEvent::ExportFailed {
          kind: kind.to_string(),
          error: e.to_string(),
        });
        errors.push((position, e));
        if policy == ExportPolicy::FailFast {
          join_set.abort_all();
        }
      }
    }
  }

  if errors.is_empty() {
    results.sort_by_key(|(position, _)| *position);
    Ok(results.into_iter().map(|(_, result)| result).collect())
  } else {
    errors.sort_by_key(|(position, _)| *position);
    Err(errors.into_iter().map(|(_, e)| e).collect())
  }
}
