//! Executor for exec nodes.
//!
//! Each exec gets a private root filesystem staged from its root input, so
//! cached snapshots are never written. The command runs inside a namespace
//! [`Sandbox`] rooted there, with a cleared environment. Read-write mounts
//! are staged straight into their output directories; read-only mounts bind
//! their snapshot or local source directly.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::consts::{DEFAULT_PATH, SOURCE_DATE_EPOCH};
use crate::definition::{ExecMeta, MountDef};
use crate::image::ImageError;
use crate::util::fs::{copy_tree, remove_path};
use crate::util::hash::DirHashError;

use super::cache::{CacheError, StagedEntry};
use super::sandbox::{self, Sandbox};

/// Lines of stderr kept when a command fails.
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum ExecError {
  #[error("command failed with exit code {code:?}: {args}")]
  CommandFailed { args: String, code: Option<i32> },

  #[error("failed to spawn {program}: {source}")]
  Spawn {
    program: String,
    #[source]
    source: io::Error,
  },

  #[error("user and mount namespaces are not available on this host")]
  SandboxUnavailable,

  #[error("failed to prepare sandbox: {0}")]
  Sandbox(#[source] io::Error),

  #[error("local source {0:?} was not provided")]
  MissingLocal(String),

  #[error(transparent)]
  Image(#[from] ImageError),

  #[error(transparent)]
  Cache(#[from] CacheError),

  #[error("failed to hash local source: {0}")]
  Hash(#[from] DirHashError),

  #[error("io error: {0}")]
  Io(#[from] io::Error),

  #[error("cancelled")]
  Cancelled,
}

/// Run an exec node inside `staged`.
///
/// `sources` holds, for each entry of `mounts`, the snapshot directory to bind
/// or `None` for an empty scratch layer. On success every output directory of
/// `staged` is populated: output 0 with the root filesystem, the others with
/// the final state of their read-write mounts.
pub async fn run_exec(
  meta: &ExecMeta,
  mounts: &[MountDef],
  sources: &[Option<PathBuf>],
  staged: &StagedEntry,
) -> Result<(), ExecError> {
  if !sandbox::supported() {
    return Err(ExecError::SandboxUnavailable);
  }

  let rootfs = staged.rootfs();
  fs::create_dir_all(&rootfs)?;
  if let Some(Some(src)) = sources.first() {
    copy_tree(src, &rootfs)?;
  }

  let readonly_root = mounts.first().is_some_and(|m| m.readonly);
  let mut sandbox = Sandbox::new(&rootfs, &meta.cwd).readonly_root(readonly_root);
  for i in mount_order(mounts) {
    let source = stage_mount(&mounts[i], sources.get(i).cloned().flatten(), staged, i)?;
    sandbox.bind(source, &mounts[i].target, mounts[i].readonly);
  }
  let prepared = sandbox.prepare().map_err(ExecError::Sandbox)?;

  let program = meta.args.first().ok_or_else(|| ExecError::CommandFailed {
    args: String::new(),
    code: None,
  })?;
  let args = meta.args.join(" ");
  info!(cmd = %args, "executing command");

  let mut command = Command::new(program);
  command
    .args(&meta.args[1..])
    // Clear all environment variables
    .env_clear()
    .env("PATH", DEFAULT_PATH)
    .env("HOME", "/homeless-shelter")
    .env("LANG", "C")
    .env("LC_ALL", "C")
    .env("SOURCE_DATE_EPOCH", SOURCE_DATE_EPOCH.to_string())
    .envs(&meta.env)
    .stdin(Stdio::null())
    .kill_on_drop(true);
  prepared.install(&mut command);

  debug!(program = %program, rootfs = ?rootfs, cwd = %meta.cwd, "spawning sandboxed process");

  let output = command.output().await.map_err(|source| ExecError::Spawn {
    program: program.clone(),
    source,
  })?;
  prepared.cleanup().map_err(ExecError::Sandbox)?;

  let stdout = String::from_utf8_lossy(&output.stdout);
  if !stdout.trim().is_empty() {
    debug!(stdout = %stdout.trim(), "command stdout");
  }

  if !output.status.success() {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<&str> = stderr.lines().collect();
    let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");
    if !tail.is_empty() {
      debug!(stderr = %tail, "command stderr");
    }
    return Err(ExecError::CommandFailed {
      args,
      code: output.status.code(),
    });
  }

  remove_path(&staged.path().join("scratch"))?;
  let root_output = staged.output(0);
  remove_path(&root_output)?;
  fs::rename(&rootfs, &root_output)?;
  Ok(())
}

/// Indices of non-root mounts, shallowest first, so nested mounts land inside their parents.
fn mount_order(mounts: &[MountDef]) -> Vec<usize> {
  let mut order: Vec<usize> = (1..mounts.len()).collect();
  order.sort_by_key(|&i| mounts[i].target.split('/').filter(|c| !c.is_empty()).count());
  order
}

/// Directory to bind for mount `index`.
///
/// Read-write mounts get their output directory, seeded with a copy of the
/// input. Read-only mounts bind their input as is, or an empty directory.
fn stage_mount(mount: &MountDef, source: Option<PathBuf>, staged: &StagedEntry, index: usize) -> io::Result<PathBuf> {
  if mount.readonly
    && let Some(source) = source
  {
    return Ok(source);
  }

  let dir = match mount.output {
    Some(output) => staged.output(output),
    None => staged.path().join("scratch").join(index.to_string()),
  };
  fs::create_dir_all(&dir)?;
  if let Some(source) = source {
    copy_tree(&source, &dir)?;
  }
  Ok(dir)
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use crate::solve::cache::SnapshotCache;
  use std::collections::BTreeMap;
  use tempfile::tempdir;

  fn meta(args: &[&str]) -> ExecMeta {
    ExecMeta {
      args: args.iter().map(|s| s.to_string()).collect(),
      env: BTreeMap::new(),
      cwd: "/".to_string(),
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

  fn mount(target: &str, input: Option<u32>, readonly: bool, output: Option<u32>) -> MountDef {
    MountDef {
      target: target.to_string(),
      input,
      readonly,
      output,
    }
  }

  #[tokio::test]
  async fn scratch_mount_becomes_output() {
    if !sandbox::supported() {
      return;
    }
    let temp = tempdir().unwrap();
    let cache = SnapshotCache::open(temp.path());
    let staged = cache.stage(2).unwrap();

    let mounts = vec![root_mount(None), mount("/out", None, false, Some(1))];
    run_exec(
      &meta(&["sh", "-c", "echo -n bar > /out/foo && echo root > /r"]),
      &mounts,
      &[None, None],
      &staged,
    )
    .await
    .unwrap();

    assert_eq!(fs::read(staged.output(1).join("foo")).unwrap(), b"bar");
    assert_eq!(fs::read(staged.output(0).join("r")).unwrap(), b"root\n");
    // The mountpoint stays in the root output, empty.
    assert_eq!(fs::read_dir(staged.output(0).join("out")).unwrap().count(), 0);
  }

  #[tokio::test]
  async fn absolute_paths_stay_inside_the_root() {
    if !sandbox::supported() {
      return;
    }
    let temp = tempdir().unwrap();
    let cache = SnapshotCache::open(temp.path());
    let staged = cache.stage(1).unwrap();
    let host_file = temp.path().join("escaped");

    let script = format!(
      "mkdir -p /tmp {dir} && echo inside > /tmp/marker && echo escaped > {file}",
      dir = temp.path().display(),
      file = host_file.display()
    );
    run_exec(&meta(&["sh", "-c", &script]), &[root_mount(None)], &[None], &staged)
      .await
      .unwrap();

    assert!(!host_file.exists());
    assert_eq!(fs::read(staged.output(0).join("tmp/marker")).unwrap(), b"inside\n");
    let inside = staged.output(0).join(host_file.strip_prefix("/").unwrap());
    assert_eq!(fs::read(inside).unwrap(), b"escaped\n");
  }

  #[tokio::test]
  async fn host_tool_mountpoints_are_removed() {
    if !sandbox::supported() {
      return;
    }
    let temp = tempdir().unwrap();
    let cache = SnapshotCache::open(temp.path());
    let staged = cache.stage(1).unwrap();

    run_exec(&meta(&["sh", "-c", "test -c /dev/null && echo ok > /ok"]), &[root_mount(None)], &[None], &staged)
      .await
      .unwrap();

    let mut names: Vec<String> = fs::read_dir(staged.output(0))
      .unwrap()
      .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
      .collect();
    names.sort();
    assert_eq!(names, vec!["ok"]);
  }

  #[tokio::test]
  async fn readonly_source_is_not_modified_and_not_in_root() {
    if !sandbox::supported() {
      return;
    }
    let temp = tempdir().unwrap();
    let cache = SnapshotCache::open(temp.path());
    let staged = cache.stage(1).unwrap();

    let src = tempdir().unwrap();
    fs::write(src.path().join("foo"), b"bar").unwrap();

    let mounts = vec![root_mount(None), mount("/mnt", Some(0), true, None)];
    run_exec(
      &meta(&["sh", "-c", "cat /mnt/foo > /copy && ! touch /mnt/foo 2>/dev/null"]),
      &mounts,
      &[None, Some(src.path().to_path_buf())],
      &staged,
    )
    .await
    .unwrap();

    assert_eq!(fs::read(src.path().join("foo")).unwrap(), b"bar");
    assert_eq!(fs::read(staged.output(0).join("copy")).unwrap(), b"bar");
    assert!(!staged.output(0).join("mnt/foo").exists());
  }

  #[tokio::test]
  async fn readwrite_input_is_copied_not_shared() {
    if !sandbox::supported() {
      return;
    }
    let temp = tempdir().unwrap();
    let cache = SnapshotCache::open(temp.path());
    let staged = cache.stage(2).unwrap();

    let src = tempdir().unwrap();
    fs::write(src.path().join("foo"), b"bar").unwrap();

    let mounts = vec![root_mount(None), mount("/work", Some(0), false, Some(1))];
    run_exec(
      &meta(&["sh", "-c", "echo changed > /work/foo"]),
      &mounts,
      &[None, Some(src.path().to_path_buf())],
      &staged,
    )
    .await
    .unwrap();

    assert_eq!(fs::read(src.path().join("foo")).unwrap(), b"bar");
    assert_eq!(fs::read(staged.output(1).join("foo")).unwrap(), b"changed\n");
  }

  #[tokio::test]
  async fn hidden_content_is_restored() {
    if !sandbox::supported() {
      return;
    }
    let temp = tempdir().unwrap();
    let cache = SnapshotCache::open(temp.path());
    let staged = cache.stage(2).unwrap();

    let base = tempdir().unwrap();
    fs::create_dir_all(base.path().join("out")).unwrap();
    fs::write(base.path().join("out/original"), b"keep").unwrap();

    let mounts = vec![root_mount(Some(0)), mount("/out", None, false, Some(1))];
    run_exec(
      &meta(&["sh", "-c", "test ! -e /out/original && touch /out/new"]),
      &mounts,
      &[Some(base.path().to_path_buf()), None],
      &staged,
    )
    .await
    .unwrap();

    assert!(staged.output(1).join("new").exists());
    assert!(!staged.output(1).join("original").exists());
    assert_eq!(fs::read(staged.output(0).join("out/original")).unwrap(), b"keep");
  }

  #[tokio::test]
  async fn environment_is_isolated() {
    if !sandbox::supported() {
      return;
    }
    let temp = tempdir().unwrap();
    let cache = SnapshotCache::open(temp.path());
    let staged = cache.stage(1).unwrap();

    // cargo sets CARGO_MANIFEST_DIR for the test process; it must not leak through.
    let mut m = meta(&[
      "sh",
      "-c",
      "echo \"$HOME $SOURCE_DATE_EPOCH $EXTRA ${CARGO_MANIFEST_DIR:-unset} $(id -u)\" > /env.txt",
    ]);
    m.env.insert("EXTRA".to_string(), "yes".to_string());
    run_exec(&m, &[root_mount(None)], &[None], &staged).await.unwrap();

    let env = fs::read_to_string(staged.output(0).join("env.txt")).unwrap();
    assert_eq!(env, "/homeless-shelter 315532800 yes unset 0\n");
  }

  #[tokio::test]
  async fn cwd_is_inside_rootfs() {
    if !sandbox::supported() {
      return;
    }
    let temp = tempdir().unwrap();
    let cache = SnapshotCache::open(temp.path());
    let staged = cache.stage(1).unwrap();

    let mut m = meta(&["sh", "-c", "echo here > file && pwd > /pwd"]);
    m.cwd = "/work/dir".to_string();
    run_exec(&m, &[root_mount(None)], &[None], &staged).await.unwrap();

    assert!(staged.output(0).join("work/dir/file").exists());
    assert_eq!(fs::read(staged.output(0).join("pwd")).unwrap(), b"/work/dir\n");
  }

  #[tokio::test]
  async fn nonzero_exit_is_command_failed() {
    if !sandbox::supported() {
      return;
    }
    let temp = tempdir().unwrap();
    let cache = SnapshotCache::open(temp.path());
    let staged = cache.stage(1).unwrap();

    let err = run_exec(&meta(&["sh", "-c", "exit 3"]), &[root_mount(None)], &[None], &staged)
      .await
      .unwrap_err();
    assert!(matches!(err, ExecError::CommandFailed { code: Some(3), .. }));
  }

  #[tokio::test]
  async fn missing_program_is_spawn_error() {
    if !sandbox::supported() {
      return;
    }
    let temp = tempdir().unwrap();
    let cache = SnapshotCache::open(temp.path());
    let staged = cache.stage(1).unwrap();

    let err = run_exec(&meta(&["kiln-no-such-program"]), &[root_mount(None)], &[None], &staged)
      .await
      .unwrap_err();
    assert!(matches!(err, ExecError::Spawn { .. }));
  }

  #[test]
  fn mount_order_is_shallowest_first() {
    let mounts = vec![
      root_mount(None),
      mount("/a/b/c", None, true, None),
      mount("/a", None, true, None),
      mount("/x/y", None, true, None),
    ];
    assert_eq!(mount_order(&mounts), vec![2, 3, 1]);
  }
}
