//! Solver: resolves every node of a definition to a filesystem snapshot.
//!
//! Nodes run wave by wave in dependency order, with up to `parallelism` nodes
//! in flight. Results are cached by a key derived from the node digest and
//! the keys of its inputs, so re-solving an unchanged graph executes nothing.
//!
//! A failing node fails the solve, and every node depending on it is skipped.
//! Independent branches still run to completion and stay cached.
//!
//! # Submodules
//!
//! - [`cache`] - single-flight snapshot cache
//! - [`dag`] - wave computation
//! - [`exec`] - exec node runner
//! - [`sandbox`] - user and mount namespace isolation

pub mod cache;
pub mod dag;
pub mod exec;
pub mod sandbox;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::consts::PARALLELISM_ENV;
use crate::definition::{Definition, NodeDef, Op};
use crate::image::ImageStore;
use crate::progress::{ProgressBus, ProgressEvent};
use crate::util::hash::{Digest, hash_directory, hash_parts};

use cache::SnapshotCache;
use dag::ExecutionDag;

pub use exec::ExecError;

#[derive(Debug, Error)]
pub enum SolveError {
  #[error("{description} ({digest}) failed: {source}")]
  Execution {
    digest: Digest,
    description: String,
    source: ExecError,
  },

  #[error("node {0} is not in the definition")]
  UnknownNode(Digest),

  #[error("dependency cycle detected")]
  CycleDetected,

  #[error("solve cancelled")]
  Cancelled,
}

#[derive(Debug, Clone)]
pub struct SolveConfig {
  /// Maximum number of nodes executing at once.
  pub parallelism: usize,
}

impl SolveConfig {
  /// Defaults, with `KILN_PARALLELISM` applied when set to a positive integer.
  pub fn from_env() -> Self {
    let mut config = Self::default();
    if let Ok(value) = std::env::var(PARALLELISM_ENV) {
      match value.parse::<usize>() {
        Ok(n) if n > 0 => config.parallelism = n,
        _ => warn!(value = %value, "ignoring invalid {}", PARALLELISM_ENV),
      }
    }
    config
  }
}

impl Default for SolveConfig {
  fn default() -> Self {
    Self {
      parallelism: std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4),
    }
  }
}

/// A resolved filesystem state. Read-only for everyone but the solver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
  /// Cache key of the node that produced it.
  pub key: Digest,
  /// Output index within that node.
  pub index: u32,
  pub path: PathBuf,
}

#[derive(Debug)]
pub struct SolveResult {
  /// Snapshot of the definition's root reference.
  pub root: Snapshot,
  /// Nodes that ran during this solve.
  pub executed: Vec<Digest>,
  /// Nodes served from the cache.
  pub cached: Vec<Digest>,
}

#[derive(Debug, Clone)]
struct Resolved {
  key: Digest,
  outputs: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
  Executed,
  Cached,
  /// Local sources are read in place.
  Local,
}

/// An input of a node, already resolved.
#[derive(Debug, Clone)]
struct ResolvedInput {
  key: Digest,
  index: u32,
  path: PathBuf,
}

pub struct Solver {
  cache: Arc<SnapshotCache>,
  images: Arc<ImageStore>,
  config: SolveConfig,
  progress: ProgressBus,
}

impl Solver {
  pub fn new(cache: Arc<SnapshotCache>, images: Arc<ImageStore>, config: SolveConfig) -> Self {
    Self {
      cache,
      images,
      config,
      progress: ProgressBus::new(),
    }
  }

  pub fn with_progress(mut self, progress: ProgressBus) -> Self {
    self.progress = progress;
    self
  }

  /// Solve `definition`, binding `Local` nodes to the directories in `locals`.
  pub async fn solve(
    &self,
    definition: &Definition,
    locals: &BTreeMap<String, PathBuf>,
    cancel: &CancelToken,
  ) -> Result<SolveResult, SolveError> {
    if cancel.is_cancelled() {
      return Err(SolveError::Cancelled);
    }

    let dag = ExecutionDag::from_definition(definition)?;
    let waves = dag.waves()?;
    info!(nodes = dag.node_count(), waves = waves.len(), "starting solve");

    let semaphore = Arc::new(Semaphore::new(self.config.parallelism.max(1)));
    let locals = Arc::new(locals.clone());

    let mut resolved: HashMap<Digest, Resolved> = HashMap::new();
    let mut failed: HashSet<Digest> = HashSet::new();
    let mut failure: Option<SolveError> = None;
    let mut executed = Vec::new();
    let mut cached = Vec::new();

    for (wave_idx, wave) in waves.iter().enumerate() {
      debug!(wave = wave_idx, nodes = wave.len(), "executing wave");

      let mut join_set = JoinSet::new();
      let mut tasks: HashMap<tokio::task::Id, Digest> = HashMap::new();

      for digest in wave {
        let node = definition
          .get(digest)
          .ok_or_else(|| SolveError::UnknownNode(digest.clone()))?
          .clone();
        let description = node.op.description();

        if let Some(dep) = dag.dependencies(digest).into_iter().find(|d| failed.contains(d)) {
          warn!(digest = %digest, failed_dep = %dep, "skipping node due to failed dependency");
          self.progress.publish(ProgressEvent::NodeSkipped {
            digest: digest.clone(),
            description,
            failed_dependency: dep,
          });
          failed.insert(digest.clone());
          continue;
        }

        let inputs = node
          .inputs
          .iter()
          .map(|input| {
            let dep = resolved
              .get(&input.digest)
              .ok_or_else(|| SolveError::UnknownNode(input.digest.clone()))?;
            Ok(ResolvedInput {
              key: dep.key.clone(),
              index: input.index,
              path: dep.outputs[input.index as usize].clone(),
            })
          })
          .collect::<Result<Vec<_>, SolveError>>()?;

        let task = NodeTask {
          digest: digest.clone(),
          node,
          inputs,
          locals: locals.clone(),
          cache: self.cache.clone(),
          images: self.images.clone(),
          progress: self.progress.clone(),
        };
        let semaphore = semaphore.clone();
        let handle = join_set.spawn(async move {
          let _permit = semaphore.acquire_owned().await.map_err(|_| ExecError::Cancelled)?;
          task.run().await
        });
        tasks.insert(handle.id(), digest.clone());
      }

      loop {
        let next = tokio::select! {
          biased;
          _ = cancel.cancelled() => {
            warn!("solve cancelled, aborting running nodes");
            join_set.abort_all();
            // Wait for aborted nodes to drop their staging directories.
            while join_set.join_next().await.is_some() {}
            return Err(SolveError::Cancelled);
          }
          next = join_set.join_next_with_id() => next,
        };

        let Some(joined) = next else {
          break;
        };

        let (id, result) = match joined {
          Ok((id, result)) => (id, result),
          Err(e) => {
            let id = e.id();
            error!(error = %e, "node task panicked");
            (id, Err(ExecError::Io(std::io::Error::other(e.to_string()))))
          }
        };
        let Some(digest) = tasks.remove(&id) else {
          continue;
        };
        let description = definition
          .get(&digest)
          .map(|n| n.op.description())
          .unwrap_or_default();

        match result {
          Ok((node, outcome)) => {
            match outcome {
              Outcome::Executed => {
                self.progress.publish(ProgressEvent::NodeCompleted {
                  digest: digest.clone(),
                  description,
                });
                executed.push(digest.clone());
              }
              Outcome::Cached => {
                self.progress.publish(ProgressEvent::NodeCached {
                  digest: digest.clone(),
                  description,
                });
                cached.push(digest.clone());
              }
              Outcome::Local => {
                self.progress.publish(ProgressEvent::NodeCompleted {
                  digest: digest.clone(),
                  description,
                });
              }
            }
            resolved.insert(digest, node);
          }
          Err(ExecError::Cancelled) if cancel.is_cancelled() => {
            join_set.abort_all();
            while join_set.join_next().await.is_some() {}
            return Err(SolveError::Cancelled);
          }
          Err(e) => {
            error!(digest = %digest, error = %e, "node failed");
            self.progress.publish(ProgressEvent::NodeFailed {
              digest: digest.clone(),
              description: description.clone(),
              error: e.to_string(),
            });
            failed.insert(digest.clone());
            failure.get_or_insert(SolveError::Execution {
              digest,
              description,
              source: e,
            });
          }
        }
      }
    }

    if let Some(err) = failure {
      return Err(err);
    }
    if cancel.is_cancelled() {
      return Err(SolveError::Cancelled);
    }

    let root_ref = definition.root();
    let root_node = resolved
      .get(&root_ref.digest)
      .ok_or_else(|| SolveError::UnknownNode(root_ref.digest.clone()))?;
    let root = Snapshot {
      key: root_node.key.clone(),
      index: root_ref.index,
      path: root_node.outputs[root_ref.index as usize].clone(),
    };

    info!(
      executed = executed.len(),
      cached = cached.len(),
      root = %root.key,
      "solve complete"
    );

    Ok(SolveResult { root, executed, cached })
  }
}

/// Everything one node needs to resolve, owned so it can run on its own task.
struct NodeTask {
  digest: Digest,
  node: NodeDef,
  inputs: Vec<ResolvedInput>,
  locals: Arc<BTreeMap<String, PathBuf>>,
  cache: Arc<SnapshotCache>,
  images: Arc<ImageStore>,
  progress: ProgressBus,
}

impl NodeTask {
  async fn run(self) -> Result<(Resolved, Outcome), ExecError> {
    let digest = self.digest.clone();
    let description = self.node.op.description();
    let output_count = self.node.op.output_count();
    let started = ProgressEvent::NodeStarted {
      digest: digest.clone(),
      description,
    };

    match self.node.op {
      Op::Local { name } => {
        let dir = self
          .locals
          .get(&name)
          .filter(|dir| dir.is_dir())
          .ok_or_else(|| ExecError::MissingLocal(name.clone()))?
          .clone();
        let content = hash_directory(&dir, &[])?;
        let key = hash_parts([digest.as_str(), content.as_str()]);
        debug!(digest = %digest, local = %name, content = %content, "resolved local source");
        Ok((
          Resolved {
            key,
            outputs: vec![dir],
          },
          Outcome::Local,
        ))
      }

      Op::Image { reference } => {
        let record = self.images.resolve(&reference)?;
        let key = hash_parts([digest.as_str(), record.digest().as_str()]);
        let images = self.images.clone();
        let progress = self.progress.clone();

        let (entry, hit) = self
          .cache
          .get_or_compute(&key, output_count, |staged| async move {
            progress.publish(started);
            images.extract(&record, &staged.output(0))?;
            Ok::<_, ExecError>(staged)
          })
          .await?;

        Ok((
          Resolved {
            key,
            outputs: entry.outputs,
          },
          if hit { Outcome::Cached } else { Outcome::Executed },
        ))
      }

      Op::Exec { meta, mounts } => {
        let input_parts: Vec<String> = self
          .inputs
          .iter()
          .map(|input| format!("{}#{}", input.key, input.index))
          .collect();
        let key = hash_parts(std::iter::once(digest.as_str()).chain(input_parts.iter().map(String::as_str)));

        let sources: Vec<Option<PathBuf>> = mounts
          .iter()
          .map(|m| m.input.map(|i| self.inputs[i as usize].path.clone()))
          .collect();
        let progress = self.progress.clone();

        let (entry, hit) = self
          .cache
          .get_or_compute(&key, output_count, |staged| async move {
            progress.publish(started);
            exec::run_exec(&meta, &mounts, &sources, &staged).await?;
            Ok::<_, ExecError>(staged)
          })
          .await?;

        Ok((
          Resolved {
            key,
            outputs: entry.outputs,
          },
          if hit { Outcome::Cached } else { Outcome::Executed },
        ))
      }
    }
  }
}
