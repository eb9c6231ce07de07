//! Shared test helpers for CLI integration tests.

use std::path::PathBuf;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

use kiln_lib::cancel::CancelToken;
use kiln_lib::graph::State;

/// Isolated test environment.
///
/// Each test gets its own temporary directory holding the state root, local
/// sources and export destinations.
pub struct TestEnv {
  pub temp: TempDir,
}

impl TestEnv {
  pub fn new() -> Self {
    Self {
      temp: TempDir::new().unwrap(),
    }
  }

  /// State root (isolated per test).
  pub fn root_path(&self) -> PathBuf {
    let p = self.temp.path().join("kiln");
    std::fs::create_dir_all(&p).unwrap();
    dunce::canonicalize(&p).unwrap_or(p)
  }

  /// A path inside the temp directory. Not created.
  pub fn path(&self, relative_path: &str) -> PathBuf {
    self.temp.path().join(relative_path)
  }

  /// Write a file relative to the temp directory.
  pub fn write_file(&self, relative_path: &str, content: &str) {
    let path = self.path(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
  }

  /// Get a pre-configured Command for the kiln binary.
  ///
  /// `KILN_ROOT` points at the isolated state root; inherited log and
  /// tuning variables are cleared.
  pub fn kiln_cmd(&self) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("kiln");
    cmd.env("KILN_ROOT", self.root_path());
    cmd.env_remove("RUST_LOG");
    cmd.env_remove("KILN_PARALLELISM");
    cmd.env_remove("KILN_SNAPSHOTTER");
    cmd
  }

  /// Register an empty image under `name`, standing in for a base image.
  pub fn seed_image(&self, name: &str) {
    let dir = self.path("seed");
    std::fs::create_dir_all(&dir).unwrap();
    self
      .kiln_cmd()
      .args(["image", "import", name])
      .arg(&dir)
      .assert()
      .success();
  }

  /// Run `kiln image inspect` and parse its JSON output.
  pub fn inspect(&self, name: &str, snapshotter: Option<&str>) -> serde_json::Value {
    let mut cmd = self.kiln_cmd();
    cmd.args(["image", "inspect", name]);
    if let Some(snapshotter) = snapshotter {
      cmd.args(["--snapshotter", snapshotter]);
    }
    let output = cmd.output().unwrap();
    assert!(output.status.success(), "inspect failed: {}", String::from_utf8_lossy(&output.stderr));
    serde_json::from_slice(&output.stdout).unwrap()
  }
}

/// Whether builds can run commands on this host. Tests that execute
/// commands return early when user namespaces are unavailable.
pub fn sandboxed() -> bool {
  kiln_lib::solve::sandbox::supported()
}

/// Marshal and encode a graph for piping into `kiln build`.
pub fn encode(state: &State) -> Vec<u8> {
  state.marshal(&CancelToken::new()).unwrap().to_bytes().unwrap()
}
