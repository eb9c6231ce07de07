//! Build session: one definition in, snapshots solved, artifacts out.
//!
//! [`Engine::build`] drives a [`BuildRequest`] through every stage:
//!
//! 1. take the shared store lock
//! 2. validate exporter configs, then decode and validate the definition
//! 3. check that every local source the definition names was supplied
//! 4. solve
//! 5. run the exporters against the root snapshot
//! 6. write the metadata record, only if everything above succeeded
//!
//! A timeout behaves exactly like cancellation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::cancel::CancelToken;
use crate::consts::{DEFAULT_SNAPSHOTTER, SNAPSHOTTER_ENV};
use crate::definition::{Definition, DefinitionError, Op};
use crate::export::{ExportConfig, ExportError, ExportPolicy, ExportResult, Exporter, run_exports};
use crate::image::ImageStore;
use crate::metadata::{MetadataError, MetadataRecord};
use crate::platform::paths::{images_dir, root_dir};
use crate::progress::{ProgressBus, ProgressEvent};
use crate::solve::cache::SnapshotCache;
use crate::solve::{SolveConfig, SolveError, Snapshot, Solver};
use crate::store_lock::{LockMode, StoreLock, StoreLockError};
use crate::util::hash::Digest;

#[derive(Debug, Error)]
pub enum BuildError {
  #[error("invalid definition: {0}")]
  Validation(#[from] DefinitionError),

  #[error("local source {0:?} was not provided")]
  MissingLocal(String),

  #[error(transparent)]
  Execution(SolveError),

  #[error("{}", describe_export_errors(.0))]
  Export(Vec<ExportError>),

  #[error(transparent)]
  Metadata(#[from] MetadataError),

  #[error("build cancelled")]
  Cancelled,

  #[error(transparent)]
  Lock(#[from] StoreLockError),
}

fn describe_export_errors(errors: &[ExportError]) -> String {
  errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
  /// State root holding the cache, the image store and the lock file.
  pub root: PathBuf,
  pub parallelism: usize,
  /// Snapshotter used by image exports that don't name one.
  pub snapshotter: String,
}

impl EngineConfig {
  /// `KILN_ROOT`, `KILN_PARALLELISM` and `KILN_SNAPSHOTTER`, with defaults.
  pub fn from_env() -> Self {
    let snapshotter = std::env::var(SNAPSHOTTER_ENV)
      .ok()
      .filter(|s| !s.is_empty())
      .unwrap_or_else(|| DEFAULT_SNAPSHOTTER.to_string());
    Self {
      root: root_dir(),
      parallelism: SolveConfig::from_env().parallelism,
      snapshotter,
    }
  }

  pub fn with_root(root: impl Into<PathBuf>) -> Self {
    Self {
      root: root.into(),
      parallelism: SolveConfig::default().parallelism,
      snapshotter: DEFAULT_SNAPSHOTTER.to_string(),
    }
  }
}

#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
  /// Encoded definition, as produced by [`Definition::to_bytes`].
  pub definition: Vec<u8>,
  pub locals: BTreeMap<String, PathBuf>,
  pub exports: Vec<ExportConfig>,
  pub metadata_file: Option<PathBuf>,
  pub export_policy: ExportPolicy,
  pub timeout: Option<Duration>,
}

impl BuildRequest {
  pub fn new(definition: Vec<u8>) -> Self {
    Self {
      definition,
      ..Default::default()
    }
  }

  pub fn local(mut self, name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
    self.locals.insert(name.into(), dir.into());
    self
  }

  pub fn export(mut self, config: ExportConfig) -> Self {
    self.exports.push(config);
    self
  }

  pub fn metadata_file(mut self, path: impl Into<PathBuf>) -> Self {
    self.metadata_file = Some(path.into());
    self
  }

  pub fn export_policy(mut self, policy: ExportPolicy) -> Self {
    self.export_policy = policy;
    self
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }
}

#[derive(Debug)]
pub struct BuildOutcome {
  pub root: Snapshot,
  /// One result per requested export, in request order.
  pub exports: Vec<ExportResult>,
  pub metadata: MetadataRecord,
  pub executed: Vec<Digest>,
  pub cached: Vec<Digest>,
}

pub struct Engine {
  config: EngineConfig,
  cache: Arc<SnapshotCache>,
  images: Arc<ImageStore>,
  progress: ProgressBus,
}

impl Engine {
  pub fn new(config: EngineConfig) -> Self {
    Self {
      cache: Arc::new(SnapshotCache::open(&config.root)),
      images: Arc::new(ImageStore::open(images_dir(&config.root))),
      progress: ProgressBus::new(),
      config,
    }
  }

  pub fn config(&self) -> &EngineConfig {
    &self.config
  }

  pub fn cache(&self) -> &Arc<SnapshotCache> {
    &self.cache
  }

  pub fn images(&self) -> &Arc<ImageStore> {
    &self.images
  }

  /// Receive progress events from every build started after this call.
  pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
    self.progress.subscribe()
  }

  pub async fn build(&self, request: BuildRequest, cancel: &CancelToken) -> Result<BuildOutcome, BuildError> {
    let result = self.run(request, cancel).await;
    match &result {
      Ok(outcome) => info!(
        executed = outcome.executed.len(),
        cached = outcome.cached.len(),
        exports = outcome.exports.len(),
        "build complete"
      ),
      Err(BuildError::Cancelled) => warn!("build cancelled"),
      Err(e) => error!(error = %e, "build failed"),
    }
    self.progress.publish(ProgressEvent::BuildCompleted {
      success: result.is_ok(),
    });
    result
  }

  async fn run(&self, request: BuildRequest, cancel: &CancelToken) -> Result<BuildOutcome, BuildError> {
    let _lock = StoreLock::acquire(&self.config.root, LockMode::Shared, "build")?;
    let cancel = cancel.with_timeout(request.timeout);

    let exporters = request
      .exports
      .iter()
      .map(|config| Exporter::from_config(config, &self.config.snapshotter))
      .collect::<Result<Vec<_>, _>>()
      .map_err(|e| BuildError::Export(vec![e]))?;

    let definition = Definition::from_bytes(&request.definition)?;
    for node in definition.nodes() {
      if let Op::Local { name } = &node.def.op
        && !request.locals.contains_key(name)
      {
        return Err(BuildError::MissingLocal(name.clone()));
      }
    }

    let solver = Solver::new(
      Arc::clone(&self.cache),
      Arc::clone(&self.images),
      SolveConfig {
        parallelism: self.config.parallelism,
      },
    )
    .with_progress(self.progress.clone());

    let solved = solver
      .solve(&definition, &request.locals, &cancel)
      .await
      .map_err(|e| match e {
        SolveError::Cancelled => BuildError::Cancelled,
        e => BuildError::Execution(e),
      })?;

    let exports = run_exports(
      exporters,
      &solved.root,
      Arc::clone(&self.images),
      request.export_policy,
      &self.progress,
      &cancel,
    )
    .await
    .map_err(|errors| {
      if cancel.is_cancelled() {
        BuildError::Cancelled
      } else {
        BuildError::Export(errors)
      }
    })?;

    let metadata = MetadataRecord::from_results(&exports);
    if let Some(path) = &request.metadata_file {
      metadata.write(path)?;
    }

    Ok(BuildOutcome {
      root: solved.root,
      exports,
      metadata,
      executed: solved.executed,
      cached: solved.cached,
    })
  }
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use crate::graph::{MountMode, Run, State, image, local, scratch};
  use crate::solve::sandbox;
  use std::fs;
  use tempfile::{TempDir, tempdir};

  struct Fixture {
    temp: TempDir,
    engine: Engine,
  }

  impl Fixture {
    fn new() -> Self {
      let temp = tempdir().unwrap();
      let engine = Engine::new(EngineConfig::with_root(temp.path().join("state")));
      let base = tempdir().unwrap();
      engine.images().put_snapshot("busybox", base.path()).unwrap();
      Self { temp, engine }
    }

    fn path(&self, name: &str) -> PathBuf {
      self.temp.path().join(name)
    }
  }

  fn encode(state: &State) -> Vec<u8> {
    state.marshal(&CancelToken::new()).unwrap().to_bytes().unwrap()
  }

  fn writes_foo() -> State {
    image("busybox")
      .run(Run::shlex("sh -c 'echo -n bar > /out/foo'").mount("/out", scratch(), MountMode::ReadWrite))
      .get_mount("/out")
  }

  #[tokio::test]
  async fn local_export_delivers_bytes() {
    if !sandbox::supported() {
      return;
    }
    let fx = Fixture::new();
    let dest = fx.path("out");
    let request = BuildRequest::new(encode(&writes_foo()))
      .export(ExportConfig::new("local").option("output", dest.to_str().unwrap()));

    let outcome = fx.engine.build(request, &CancelToken::new()).await.unwrap();

    assert_eq!(fs::read(dest.join("foo")).unwrap(), b"bar");
    assert_eq!(outcome.exports.len(), 1);
  }

  #[tokio::test]
  async fn metadata_digest_matches_image_store() {
    if !sandbox::supported() {
      return;
    }
    let fx = Fixture::new();
    let metadata_file = fx.path("metadata.json");
    let request = BuildRequest::new(encode(&writes_foo()))
      .export(ExportConfig::parse_csv("type=image,name=example.com/moby/metadata:test,push=false").unwrap())
      .metadata_file(&metadata_file);

    fx.engine.build(request, &CancelToken::new()).await.unwrap();

    let written: BTreeMap<String, String> = serde_json::from_slice(&fs::read(&metadata_file).unwrap()).unwrap();
    let record = fx.engine.images().resolve("example.com/moby/metadata:test").unwrap();
    assert_eq!(written["image.name"], "example.com/moby/metadata:test");
    assert_eq!(written["containerimage.digest"], record.digest().to_string());
  }

  #[tokio::test]
  async fn image_export_unpacks() {
    if !sandbox::supported() {
      return;
    }
    let fx = Fixture::new();
    let request = BuildRequest::new(encode(&writes_foo())).export(
      ExportConfig::new("image")
        .option("unpack", "true")
        .option("name", "example.com/moby/imageexporter:test"),
    );

    fx.engine.build(request, &CancelToken::new()).await.unwrap();

    let record = fx.engine.images().resolve("example.com/moby/imageexporter:test").unwrap();
    assert!(record.is_unpacked("overlayfs"));
  }

  #[tokio::test]
  async fn two_image_exporters_fold_into_one_record() {
    if !sandbox::supported() {
      return;
    }
    let fx = Fixture::new();
    let metadata_file = fx.path("metadata.json");
    let request = BuildRequest::new(encode(&writes_foo()))
      .export(ExportConfig::parse_csv("type=image,name=example.com/a:1").unwrap())
      .export(ExportConfig::parse_csv("type=image,name=example.com/b:1,unpack=true").unwrap())
      .metadata_file(&metadata_file);

    let outcome = fx.engine.build(request, &CancelToken::new()).await.unwrap();

    let a = fx.engine.images().resolve("example.com/a:1").unwrap();
    let b = fx.engine.images().resolve("example.com/b:1").unwrap();
    assert_eq!(a.digest(), b.digest());
    assert!(b.is_unpacked("overlayfs"));

    let written: BTreeMap<String, String> = serde_json::from_slice(&fs::read(&metadata_file).unwrap()).unwrap();
    assert_eq!(written["image.name"], "example.com/a:1,example.com/b:1");
    assert_eq!(written["containerimage.digest"], a.digest().to_string());
    assert_eq!(outcome.metadata.get("image.name"), Some("example.com/a:1,example.com/b:1"));
  }

  #[tokio::test]
  async fn local_source_consumed_read_only() {
    if !sandbox::supported() {
      return;
    }
    let fx = Fixture::new();
    let src = fx.path("src");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("foo"), b"bar").unwrap();

    let st = image("busybox")
      .run(Run::shlex("sh -c 'echo -n bar > /foo2'"))
      .run(Run::shlex("cmp -s /mnt/foo /foo2").mount("/mnt", local("src"), MountMode::ReadOnly))
      .root();
    let request = BuildRequest::new(encode(&st)).local("src", &src);

    fx.engine.build(request, &CancelToken::new()).await.unwrap();
  }

  #[tokio::test]
  async fn failed_build_writes_no_metadata() {
    if !sandbox::supported() {
      return;
    }
    let fx = Fixture::new();
    let metadata_file = fx.path("metadata.json");
    let st = image("busybox").run(Run::shell("exit 3")).root();
    let request = BuildRequest::new(encode(&st))
      .export(ExportConfig::new("image").option("name", "example.com/x:fail"))
      .metadata_file(&metadata_file);

    let err = fx.engine.build(request, &CancelToken::new()).await.unwrap_err();

    assert!(matches!(err, BuildError::Execution(_)));
    assert!(!metadata_file.exists());
    assert!(fx.engine.images().get("example.com/x:fail").unwrap().is_none());
  }

  #[tokio::test]
  async fn missing_local_rejected_before_solving() {
    let fx = Fixture::new();
    let st = image("busybox")
      .run(Run::shell("true").mount("/mnt", local("src"), MountMode::ReadOnly))
      .root();

    let err = fx
      .engine
      .build(BuildRequest::new(encode(&st)), &CancelToken::new())
      .await
      .unwrap_err();
    assert!(matches!(err, BuildError::MissingLocal(ref name) if name == "src"));
  }

  #[tokio::test]
  async fn invalid_exporter_rejected_before_solving() {
    let fx = Fixture::new();
    let st = image("busybox").run(Run::shell("touch /ran")).root();
    let request = BuildRequest::new(encode(&st)).export(ExportConfig::new("image").option("push", "true"));

    let err = fx.engine.build(request, &CancelToken::new()).await.unwrap_err();

    assert!(matches!(err, BuildError::Export(_)));
    assert!(!fx.engine.cache().snapshots_dir().exists());
  }

  #[tokio::test]
  async fn garbage_definition_is_a_validation_error() {
    let fx = Fixture::new();
    let err = fx
      .engine
      .build(BuildRequest::new(b"not a definition".to_vec()), &CancelToken::new())
      .await
      .unwrap_err();
    assert!(matches!(err, BuildError::Validation(_)));
  }

  #[tokio::test]
  async fn timeout_reports_cancellation() {
    if !sandbox::supported() {
      return;
    }
    let fx = Fixture::new();
    let st = image("busybox").run(Run::shell("sleep 30")).root();
    let request = BuildRequest::new(encode(&st)).timeout(Duration::from_millis(200));

    let err = fx.engine.build(request, &CancelToken::new()).await.unwrap_err();
    assert!(matches!(err, BuildError::Cancelled));
  }

  #[tokio::test]
  async fn rebuild_hits_cache_and_reexports_identically() {
    if !sandbox::supported() {
      return;
    }
    let fx = Fixture::new();
    let request = BuildRequest::new(encode(&writes_foo()))
      .export(ExportConfig::new("image").option("name", "example.com/x:again"));

    let first = fx.engine.build(request.clone(), &CancelToken::new()).await.unwrap();
    let second = fx.engine.build(request, &CancelToken::new()).await.unwrap();

    assert!(second.executed.is_empty());
    assert_eq!(first.exports[0].digest, second.exports[0].digest);
  }

  #[tokio::test]
  async fn progress_ends_with_build_completed() {
    if !sandbox::supported() {
      return;
    }
    let fx = Fixture::new();
    let mut events = fx.engine.subscribe();
    fx.engine
      .build(BuildRequest::new(encode(&writes_foo())), &CancelToken::new())
      .await
      .unwrap();

    let mut last = None;
    while let Ok(event) = events.try_recv() {
      last = Some(event);
    }
    assert_eq!(last, Some(ProgressEvent::BuildCompleted { success: true }));
  }
}
