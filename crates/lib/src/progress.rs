//! Structured build progress.
//!
//! Events are published on a broadcast bus. Nobody is required to listen; a
//! build with no subscribers simply drops them.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::util::hash::Digest;

const PROGRESS_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
  NodeStarted { digest: Digest, description: String },
  NodeCached { digest: Digest, description: String },
  NodeCompleted { digest: Digest, description: String },
  NodeFailed { digest: Digest, description: String, error: String },
  NodeSkipped { digest: Digest, description: String, failed_dependency: Digest },
  ExportStarted { kind: String },
  ExportCompleted { kind: String },
  ExportFailed { kind: String, error: String },
  BuildCompleted { success: bool },
}

impl ProgressEvent {
  /// One-line rendering used by `--progress=plain`.
  pub fn plain_line(&self) -> String {
    match self {
      ProgressEvent::NodeStarted { digest, description } => format!("#{} {}", digest.short(), description),
      ProgressEvent::NodeCached { digest, description } => format!("#{} {} CACHED", digest.short(), description),
      ProgressEvent::NodeCompleted { digest, description } => format!("#{} {} DONE", digest.short(), description),
      ProgressEvent::NodeFailed {
        digest,
        description,
        error,
      } => format!("#{} {} ERROR: {}", digest.short(), description, error),
      ProgressEvent::NodeSkipped {
        digest,
        description,
        failed_dependency,
      } => format!(
        "#{} {} SKIPPED (dependency {} failed)",
        digest.short(),
        description,
        failed_dependency.short()
      ),
      ProgressEvent::ExportStarted { kind } => format!("exporting to {}", kind),
      ProgressEvent::ExportCompleted { kind } => format!("exporting to {} DONE", kind),
      ProgressEvent::ExportFailed { kind, error } => format!("exporting to {} ERROR: {}", kind, error),
      ProgressEvent::BuildCompleted { success } => {
        if *success {
          "build complete".to_string()
        } else {
          "build failed".to_string()
        }
      }
    }
  }
}

#[derive(Debug, Clone)]
pub struct ProgressBus {
  sender: broadcast::Sender<ProgressEvent>,
}

impl ProgressBus {
  pub fn new() -> Self {
    let (sender, _) = broadcast::channel(PROGRESS_BUFFER_SIZE);
    Self { sender }
  }

  pub fn publish(&self, event: ProgressEvent) {
    trace!(?event, "progress");
    // No subscribers is fine
    let _ = self.sender.send(event);
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
    self.sender.subscribe()
  }
}

impl Default for ProgressBus {
  fn default() -> Self {
    Self::new()
  }
}
