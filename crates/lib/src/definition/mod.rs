//! Build definitions.
//!
//! A `Definition` is the flattened, deduplicated closure of a build graph plus
//! a reference to its terminal output. It is what crosses the transport
//! boundary between the graph builder and the solver.
//!
//! Node digests are never trusted from the wire: they are recomputed from each
//! node's serialized form, so a definition is content-addressed by construction.
//!
//! # Submodules
//!
//! - [`wire`] - versioned binary encoding

mod types;
pub mod wire;

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::Serialize;
use thiserror::Error;

use crate::util::hash::{Digest, Hashable};

pub use types::*;
pub use wire::{WIRE_MAJOR, WIRE_MINOR};

/// Errors raised while marshaling, decoding or validating a definition.
///
/// All of these are caught before the solver sees the definition.
#[derive(Debug, Error)]
pub enum DefinitionError {
  #[error("exec node has an empty command line")]
  EmptyCommand,

  #[error("invalid source: {0}")]
  InvalidSource(String),

  #[error("no writable mount at {target} on {description}")]
  UnknownMount { target: String, description: String },

  #[error("invalid mount on node {node}: {message}")]
  InvalidMount { node: Digest, message: String },

  #[error("cannot marshal an empty scratch state")]
  EmptyDefinition,

  #[error("node {node} references {missing}, which is not in the definition")]
  DanglingReference { node: Digest, missing: Digest },

  #[error("reference to output {index} of {node}, which has {count} output(s)")]
  InvalidOutput { node: Digest, index: u32, count: u32 },

  #[error("dependency cycle detected")]
  CycleDetected,

  #[error("not a kiln definition (bad magic)")]
  BadMagic,

  #[error("unsupported definition version {major}.{minor} (this engine reads {expected}.x)", expected = WIRE_MAJOR)]
  UnsupportedVersion { major: u16, minor: u16 },

  #[error("encoding error: {0}")]
  Encoding(String),

  #[error("marshal cancelled")]
  Cancelled,
}

impl From<serde_json::Error> for DefinitionError {
  fn from(e: serde_json::Error) -> Self {
    DefinitionError::Encoding(e.to_string())
  }
}

impl From<bincode::Error> for DefinitionError {
  fn from(e: bincode::Error) -> Self {
    DefinitionError::Encoding(e.to_string())
  }
}

/// A validated build definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Definition {
  nodes: Vec<Node>,
  index: HashMap<Digest, usize>,
  root: OutputRef,
}

impl Definition {
  /// Assemble and validate a definition from node definitions in dependency order.
  ///
  /// Digests are computed here. Duplicate nodes collapse into the first occurrence.
  pub fn from_parts(defs: Vec<NodeDef>, root: OutputRef) -> Result<Self, DefinitionError> {
    if defs.is_empty() {
      return Err(DefinitionError::EmptyDefinition);
    }

    let mut nodes = Vec::with_capacity(defs.len());
    let mut index = HashMap::with_capacity(defs.len());

    for def in defs {
      let digest = def.compute_digest()?;
      if index.contains_key(&digest) {
        continue;
      }
      index.insert(digest.clone(), nodes.len());
      nodes.push(Node { digest, def });
    }

    let definition = Self { nodes, index, root };
    definition.validate()?;
    Ok(definition)
  }

  pub fn nodes(&self) -> &[Node] {
    &self.nodes
  }

  pub fn root(&self) -> &OutputRef {
    &self.root
  }

  pub fn get(&self, digest: &Digest) -> Option<&NodeDef> {
    self.index.get(digest).map(|&i| &self.nodes[i].def)
  }

  /// Digests of every node reachable from the root, dependencies first.
  pub fn closure(&self) -> Vec<Digest> {
    let mut seen = HashSet::new();
    let mut order = Vec::new();
    let mut stack = vec![(self.root.digest.clone(), false)];

    while let Some((digest, expanded)) = stack.pop() {
      if expanded {
        order.push(digest);
        continue;
      }
      if !seen.insert(digest.clone()) {
        continue;
      }
      stack.push((digest.clone(), true));
      if let Some(def) = self.get(&digest) {
        for input in def.inputs.iter().rev() {
          if !seen.contains(&input.digest) {
            stack.push((input.digest.clone(), false));
          }
        }
      }
    }

    order
  }

  /// Encode with the versioned binary wire format.
  pub fn to_bytes(&self) -> Result<Vec<u8>, DefinitionError> {
    wire::encode(self.nodes.iter().map(|n| &n.def), &self.root)
  }

  /// Decode and validate bytes produced by [`Definition::to_bytes`].
  pub fn from_bytes(bytes: &[u8]) -> Result<Self, DefinitionError> {
    let (defs, root) = wire::decode(bytes)?;
    Self::from_parts(defs, root)
  }

  /// JSON rendering of the node list, for debugging.
  pub fn to_json(&self) -> Result<serde_json::Value, DefinitionError> {
    #[derive(Serialize)]
    struct JsonNode<'a> {
      digest: &'a Digest,
      #[serde(flatten)]
      def: &'a NodeDef,
    }

    #[derive(Serialize)]
    struct JsonDefinition<'a> {
      version: String,
      root: &'a OutputRef,
      nodes: Vec<JsonNode<'a>>,
    }

    let doc = JsonDefinition {
      version: format!("{}.{}", WIRE_MAJOR, WIRE_MINOR),
      root: &self.root,
      nodes: self
        .nodes
        .iter()
        .map(|n| JsonNode {
          digest: &n.digest,
          def: &n.def,
        })
        .collect(),
    };
    Ok(serde_json::to_value(doc)?)
  }

  fn validate(&self) -> Result<(), DefinitionError> {
    for node in &self.nodes {
      validate_op(node)?;

      for input in &node.def.inputs {
        self.check_ref(&node.digest, input)?;
      }
    }

    self.check_ref(&self.root.digest, &self.root)?;

    self.verify_acyclic()
  }

  fn check_ref(&self, from: &Digest, reference: &OutputRef) -> Result<(), DefinitionError> {
    let target = self.get(&reference.digest).ok_or_else(|| DefinitionError::DanglingReference {
      node: from.clone(),
      missing: reference.digest.clone(),
    })?;
    let count = target.op.output_count();
    if reference.index >= count {
      return Err(DefinitionError::InvalidOutput {
        node: reference.digest.clone(),
        index: reference.index,
        count,
      });
    }
    Ok(())
  }

  fn verify_acyclic(&self) -> Result<(), DefinitionError> {
    let mut graph = DiGraph::<(), ()>::new();
    let indices: Vec<_> = self.nodes.iter().map(|_| graph.add_node(())).collect();

    for (i, node) in self.nodes.iter().enumerate() {
      for input in &node.def.inputs {
        if let Some(&dep) = self.index.get(&input.digest) {
          graph.add_edge(indices[dep], indices[i], ());
        }
      }
    }

    toposort(&graph, None).map_err(|_| DefinitionError::CycleDetected)?;
    Ok(())
  }
}

fn validate_op(node: &Node) -> Result<(), DefinitionError> {
  match &node.def.op {
    Op::Image { reference } if reference.trim().is_empty() => {
      Err(DefinitionError::InvalidSource("empty image reference".to_string()))
    }
    Op::Local { name } if name.trim().is_empty() => Err(DefinitionError::InvalidSource("empty local name".to_string())),
    Op::Image { .. } | Op::Local { .. } => {
      if node.def.inputs.is_empty() {
        Ok(())
      } else {
        Err(DefinitionError::InvalidSource(format!(
          "source node {} must not have inputs",
          node.digest
        )))
      }
    }
    Op::Exec { meta, mounts } => {
      if meta.args.is_empty() || meta.args[0].is_empty() {
        return Err(DefinitionError::EmptyCommand);
      }
      validate_mounts(node, mounts)
    }
  }
}

fn validate_mounts(node: &Node, mounts: &[MountDef]) -> Result<(), DefinitionError> {
  let invalid = |message: String| DefinitionError::InvalidMount {
    node: node.digest.clone(),
    message,
  };

  match mounts.first() {
    Some(m) if m.target == "/" && m.output == Some(0) && !m.readonly => {}
    _ => return Err(invalid("first mount must be a writable root (/) publishing output 0".to_string())),
  }

  let mut targets = HashSet::new();
  let mut next_output = 0;

  for mount in mounts {
    if !mount.target.starts_with('/') {
      return Err(invalid(format!("mount target {} is not absolute", mount.target)));
    }
    if mount.target.split('/').any(|c| c == "..") {
      return Err(invalid(format!("mount target {} escapes the root", mount.target)));
    }
    if !targets.insert(mount.target.as_str()) {
      return Err(invalid(format!("duplicate mount target {}", mount.target)));
    }
    if let Some(input) = mount.input
      && input as usize >= node.def.inputs.len()
    {
      return Err(invalid(format!(
        "mount {} refers to input {}, but the node has {} input(s)",
        mount.target,
        input,
        node.def.inputs.len()
      )));
    }
    match (mount.readonly, mount.output) {
      (true, Some(_)) => return Err(invalid(format!("read-only mount {} cannot publish an output", mount.target))),
      (false, None) => return Err(invalid(format!("writable mount {} must publish an output", mount.target))),
      (false, Some(output)) => {
        if output != next_output {
          return Err(invalid(format!(
            "mount {} publishes output {}, expected {}",
            mount.target, output, next_output
          )));
        }
        next_output += 1;
      }
      (true, None) => {}
    }
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::BTreeMap;

  fn image(reference: &str) -> NodeDef {
    NodeDef {
      op: Op::Image {
        reference: reference.to_string(),
      },
      inputs: vec![],
    }
  }

  fn root_mount(input: Option<u32>) -> MountDef {
    MountDef {
      target: "/".to_string(),
      input,
      readonly: false,
      output: Some(0),
    }
  }

  fn exec_on(parent: &NodeDef, args: &[&str]) -> NodeDef {
    NodeDef {
      op: Op::Exec {
        meta: ExecMeta {
          args: args.iter().map(|s| s.to_string()).collect(),
          env: BTreeMap::new(),
          cwd: "/".to_string(),
        },
        mounts: vec![root_mount(Some(0))],
      },
      inputs: vec![OutputRef {
        digest: parent.compute_digest().unwrap(),
        index: 0,
      }],
    }
  }

  fn root_of(def: &NodeDef) -> OutputRef {
    OutputRef {
      digest: def.compute_digest().unwrap(),
      index: 0,
    }
  }

  #[test]
  fn accepts_well_formed_chain() {
    let base = image("busybox");
    let run = exec_on(&base, &["true"]);
    let root = root_of(&run);

    let def = Definition::from_parts(vec![base, run], root).unwrap();
    assert_eq!(def.nodes().len(), 2);
    assert_eq!(def.closure().len(), 2);
    assert_eq!(def.closure().last(), Some(&def.root().digest));
  }

  #[test]
  fn duplicate_nodes_collapse() {
    let base = image("busybox");
    let root = root_of(&base);
    let def = Definition::from_parts(vec![base.clone(), base], root).unwrap();
    assert_eq!(def.nodes().len(), 1);
  }

  #[test]
  fn rejects_dangling_reference() {
    let base = image("busybox");
    let run = exec_on(&base, &["true"]);
    let root = root_of(&run);

    let err = Definition::from_parts(vec![run], root).unwrap_err();
    assert!(matches!(err, DefinitionError::DanglingReference { .. }));
  }

  #[test]
  fn rejects_missing_root() {
    let base = image("busybox");
    let other = image("alpine");
    let err = Definition::from_parts(vec![base], root_of(&other)).unwrap_err();
    assert!(matches!(err, DefinitionError::DanglingReference { .. }));
  }

  #[test]
  fn rejects_out_of_range_output() {
    let base = image("busybox");
    let root = OutputRef {
      digest: base.compute_digest().unwrap(),
      index: 3,
    };
    let err = Definition::from_parts(vec![base], root).unwrap_err();
    assert!(matches!(err, DefinitionError::InvalidOutput { index: 3, count: 1, .. }));
  }

  #[test]
  fn rejects_empty_command() {
    let base = image("busybox");
    let run = exec_on(&base, &[]);
    let root = root_of(&run);
    let err = Definition::from_parts(vec![base, run], root).unwrap_err();
    assert!(matches!(err, DefinitionError::EmptyCommand));
  }

  #[test]
  fn rejects_mount_with_bad_input_index() {
    let base = image("busybox");
    let mut run = exec_on(&base, &["true"]);
    if let Op::Exec { mounts, .. } = &mut run.op {
      mounts.push(MountDef {
        target: "/src".into(),
        input: Some(7),
        readonly: true,
        output: None,
      });
    }
    let root = root_of(&run);
    let err = Definition::from_parts(vec![base, run], root).unwrap_err();
    assert!(matches!(err, DefinitionError::InvalidMount { .. }));
  }

  #[test]
  fn rejects_escaping_mount_target() {
    let base = image("busybox");
    let mut run = exec_on(&base, &["true"]);
    if let Op::Exec { mounts, .. } = &mut run.op {
      mounts.push(MountDef {
        target: "/../etc".into(),
        input: None,
        readonly: false,
        output: Some(1),
      });
    }
    let root = root_of(&run);
    let err = Definition::from_parts(vec![base, run], root).unwrap_err();
    assert!(matches!(err, DefinitionError::InvalidMount { .. }));
  }

  #[test]
  fn json_dump_lists_nodes_with_digests() {
    let base = image("busybox");
    let root = root_of(&base);
    let def = Definition::from_parts(vec![base], root.clone()).unwrap();

    let json = def.to_json().unwrap();
    assert_eq!(json["nodes"][0]["digest"], root.digest.to_string());
    assert_eq!(json["nodes"][0]["op"]["Image"]["reference"], "busybox");
  }
}
