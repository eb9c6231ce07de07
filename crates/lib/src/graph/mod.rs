//! Graph builder.
//!
//! Build graphs are composed from immutable [`State`] values. Every composition
//! returns a new state whose ancestry includes the previous one; nothing is ever
//! mutated in place, so two build variants can share a common prefix freely.
//!
//! Construction never fails. Problems such as an empty command line or a
//! reference to a mount that does not exist surface when the graph is
//! marshaled into a [`Definition`].
//!
//! ```
//! use kiln_lib::cancel::CancelToken;
//! use kiln_lib::graph::{image, scratch, MountMode, Run};
//!
//! let out = image("busybox")
//!   .run(Run::shlex("sh -c 'echo -n bar > out/foo'").mount("/out", scratch(), MountMode::ReadWrite))
//!   .get_mount("/out");
//!
//! let definition = out.marshal(&CancelToken::new()).unwrap();
//! assert_eq!(definition.nodes().len(), 2);
//! ```

mod shlex;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::definition::{Definition, DefinitionError, ExecMeta, MountDef, NodeDef, Op, OutputRef};
use crate::util::hash::{Digest, Hashable};

pub use shlex::shlex;

#[derive(Debug)]
enum Vertex {
  Image { reference: String },
  Local { name: String },
  Exec(ExecVertex),
}

#[derive(Debug)]
struct ExecVertex {
  meta: ExecMeta,
  root: State,
  mounts: Vec<RunMount>,
}

#[derive(Debug, Clone)]
struct RunMount {
  target: String,
  source: State,
  mode: MountMode,
}

#[derive(Debug, Clone)]
struct VertexOutput {
  vertex: Arc<Vertex>,
  /// Mountpoint whose final state this output is; `/` for sources and exec roots.
  mount: String,
}

/// How a mount is bound into an exec node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
  ReadOnly,
  ReadWrite,
}

/// An immutable reference to a filesystem state in a build graph.
///
/// The default state is scratch: an empty filesystem.
#[derive(Debug, Clone, Default)]
pub struct State {
  output: Option<VertexOutput>,
}

/// Filesystem of a named image from the image store.
pub fn image(reference: impl Into<String>) -> State {
  State::source(Vertex::Image {
    reference: reference.into(),
  })
}

/// A directory supplied by the caller under `name` when the build is invoked.
pub fn local(name: impl Into<String>) -> State {
  State::source(Vertex::Local { name: name.into() })
}

/// An empty filesystem.
pub fn scratch() -> State {
  State::default()
}

impl State {
  fn source(vertex: Vertex) -> Self {
    Self {
      output: Some(VertexOutput {
        vertex: Arc::new(vertex),
        mount: "/".to_string(),
      }),
    }
  }

  pub fn is_scratch(&self) -> bool {
    self.output.is_none()
  }

  /// Run a command with this state as its root filesystem.
  pub fn run(&self, run: Run) -> ExecState {
    let vertex = Vertex::Exec(ExecVertex {
      meta: ExecMeta {
        args: run.args,
        env: run.env,
        cwd: run.cwd,
      },
      root: self.clone(),
      mounts: run.mounts,
    });
    ExecState {
      vertex: Arc::new(vertex),
    }
  }

  /// Flatten the closure of this state into a validated definition.
  ///
  /// Nodes are emitted depth-first, dependencies before dependents, each exactly
  /// once, so the same graph always marshals to the same bytes.
  pub fn marshal(&self, cancel: &CancelToken) -> Result<Definition, DefinitionError> {
    let output = self.output.as_ref().ok_or(DefinitionError::EmptyDefinition)?;

    let mut marshaler = Marshaler {
      cancel,
      memo: HashMap::new(),
      emitted: HashSet::new(),
      defs: Vec::new(),
    };
    let root = marshaler.output_ref(output)?;

    Definition::from_parts(marshaler.defs, root)
  }
}

/// Result of [`State::run`]: the exec node and access to its outputs.
#[derive(Debug, Clone)]
pub struct ExecState {
  vertex: Arc<Vertex>,
}

impl ExecState {
  /// The root filesystem after the command ran.
  pub fn root(&self) -> State {
    self.output("/")
  }

  /// The final state of the writable mount at `target`.
  ///
  /// Asking for a read-only or unknown mount yields a state that fails to marshal.
  pub fn get_mount(&self, target: &str) -> State {
    self.output(&normalize_path(target))
  }

  /// Run another command on top of this node's root filesystem.
  pub fn run(&self, run: Run) -> ExecState {
    self.root().run(run)
  }

  fn output(&self, mount: &str) -> State {
    State {
      output: Some(VertexOutput {
        vertex: self.vertex.clone(),
        mount: mount.to_string(),
      }),
    }
  }
}

/// Parameters of a command to run. See [`State::run`].
#[derive(Debug, Clone)]
pub struct Run {
  args: Vec<String>,
  env: BTreeMap<String, String>,
  cwd: String,
  mounts: Vec<RunMount>,
}

impl Run {
  pub fn new<I, S>(args: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      args: args.into_iter().map(Into::into).collect(),
      env: BTreeMap::new(),
      cwd: "/".to_string(),
      mounts: Vec::new(),
    }
  }

  /// Split `line` into arguments the way a POSIX shell would, without running a shell.
  pub fn shlex(line: &str) -> Self {
    Self::new(shlex(line))
  }

  /// Run `script` through `/bin/sh -c`.
  pub fn shell(script: &str) -> Self {
    Self::new(["/bin/sh", "-c", script])
  }

  pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.env.insert(key.into(), value.into());
    self
  }

  pub fn cwd(mut self, dir: &str) -> Self {
    self.cwd = normalize_path(dir);
    self
  }

  /// Bind `source` at `target`. Writable mounts become outputs of the node, in
  /// the order they are added.
  pub fn mount(mut self, target: &str, source: State, mode: MountMode) -> Self {
    self.mounts.push(RunMount {
      target: normalize_path(target),
      source,
      mode,
    });
    self
  }
}

struct Marshaler<'a> {
  cancel: &'a CancelToken,
  memo: HashMap<*const Vertex, Digest>,
  emitted: HashSet<Digest>,
  defs: Vec<NodeDef>,
}

impl Marshaler<'_> {
  fn output_ref(&mut self, output: &VertexOutput) -> Result<OutputRef, DefinitionError> {
    let digest = self.visit(&output.vertex)?;
    let index = output_index(&output.vertex, &output.mount)?;
    Ok(OutputRef { digest, index })
  }

  fn input(&mut self, state: &State, inputs: &mut Vec<OutputRef>) -> Result<Option<u32>, DefinitionError> {
    match &state.output {
      None => Ok(None),
      Some(output) => {
        let reference = self.output_ref(output)?;
        inputs.push(reference);
        Ok(Some(inputs.len() as u32 - 1))
      }
    }
  }

  fn visit(&mut self, vertex: &Arc<Vertex>) -> Result<Digest, DefinitionError> {
    if self.cancel.is_cancelled() {
      return Err(DefinitionError::Cancelled);
    }
    if let Some(digest) = self.memo.get(&Arc::as_ptr(vertex)) {
      return Ok(digest.clone());
    }

    let def = match vertex.as_ref() {
      Vertex::Image { reference } => NodeDef {
        op: Op::Image {
          reference: reference.clone(),
        },
        inputs: vec![],
      },
      Vertex::Local { name } => NodeDef {
        op: Op::Local { name: name.clone() },
        inputs: vec![],
      },
      Vertex::Exec(exec) => {
        let mut inputs = Vec::new();
        let mut mounts = vec![MountDef {
          target: "/".to_string(),
          input: self.input(&exec.root, &mut inputs)?,
          readonly: false,
          output: Some(0),
        }];

        let mut next_output = 1;
        for mount in &exec.mounts {
          let readonly = mount.mode == MountMode::ReadOnly;
          let output = if readonly {
            None
          } else {
            next_output += 1;
            Some(next_output - 1)
          };
          mounts.push(MountDef {
            target: mount.target.clone(),
            input: self.input(&mount.source, &mut inputs)?,
            readonly,
            output,
          });
        }

        NodeDef {
          op: Op::Exec {
            meta: exec.meta.clone(),
            mounts,
          },
          inputs,
        }
      }
    };

    let digest = def.compute_digest()?;
    if self.emitted.insert(digest.clone()) {
      self.defs.push(def);
    }
    self.memo.insert(Arc::as_ptr(vertex), digest.clone());
    Ok(digest)
  }
}

fn output_index(vertex: &Vertex, mount: &str) -> Result<u32, DefinitionError> {
  let unknown = |description: String| DefinitionError::UnknownMount {
    target: mount.to_string(),
    description,
  };

  match vertex {
    Vertex::Image { .. } | Vertex::Local { .. } if mount == "/" => Ok(0),
    Vertex::Image { reference } => Err(unknown(format!("image {}", reference))),
    Vertex::Local { name } => Err(unknown(format!("local {}", name))),
    Vertex::Exec(exec) => {
      if mount == "/" {
        return Ok(0);
      }
      exec
        .mounts
        .iter()
        .filter(|m| m.mode == MountMode::ReadWrite)
        .position(|m| m.target == mount)
        .map(|i| i as u32 + 1)
        .ok_or_else(|| unknown(format!("exec {}", exec.meta.args.join(" "))))
    }
  }
}

/// Make `path` absolute and strip trailing slashes (except for `/` itself).
fn normalize_path(path: &str) -> String {
  let trimmed = path.trim_end_matches('/');
  if trimmed.is_empty() {
    return "/".to_string();
  }
  if trimmed.starts_with('/') {
    trimmed.to_string()
  } else {
    format!("/{}", trimmed)
  }
}
