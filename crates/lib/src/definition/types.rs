use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::util::hash::{Digest, Hashable};

/// Process parameters of an exec node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecMeta {
  pub args: Vec<String>,
  pub env: BTreeMap<String, String>,
  /// Working directory inside the node's root filesystem. Always absolute.
  pub cwd: String,
}

/// A filesystem bound into an exec node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountDef {
  /// Absolute mountpoint, `/` for the root filesystem.
  pub target: String,
  /// Index into the node's `inputs`; `None` binds an empty scratch layer.
  pub input: Option<u32>,
  pub readonly: bool,
  /// Output index the mount's final state is published under. Read-only mounts have none.
  pub output: Option<u32>,
}

// Variant order is part of the wire format: append only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
  /// Filesystem of a named image from the image store.
  Image { reference: String },
  /// A directory supplied by the caller at build time, bound by name.
  Local { name: String },
  /// Run a command with mounts bound.
  Exec { meta: ExecMeta, mounts: Vec<MountDef> },
}

impl Op {
  /// Human-readable label for logs and progress output.
  pub fn description(&self) -> String {
    match self {
      Op::Image { reference } => format!("image {}", reference),
      Op::Local { name } => format!("local {}", name),
      Op::Exec { meta, .. } => format!("exec {}", meta.args.join(" ")),
    }
  }

  pub fn output_count(&self) -> u32 {
    match self {
      Op::Image { .. } | Op::Local { .. } => 1,
      Op::Exec { mounts, .. } => mounts.iter().filter(|m| m.output.is_some()).count() as u32,
    }
  }
}

/// Reference to one output of a node, by the node's digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputRef {
  pub digest: Digest,
  pub index: u32,
}

/// Serialized form of one node: its operation plus ordered input references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDef {
  pub op: Op,
  pub inputs: Vec<OutputRef>,
}

impl Hashable for NodeDef {}

/// A node together with its digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
  pub digest: Digest,
  pub def: NodeDef,
}
