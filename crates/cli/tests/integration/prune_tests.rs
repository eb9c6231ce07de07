use predicates::prelude::*;

use super::common::TestEnv;

#[test]
fn prune_with_empty_root_succeeds() {
  let env = TestEnv::new();

  env
    .kiln_cmd()
    .arg("prune")
    .assert()
    .success()
    .stdout(predicate::str::contains("Prune complete"));
}

#[test]
fn prune_dry_run_changes_nothing() {
  let env = TestEnv::new();

  env
    .kiln_cmd()
    .args(["prune", "--dry-run", "--keep-duration", "1s"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Dry run"));
}

#[test]
fn prune_json_output_is_valid() {
  let env = TestEnv::new();

  env
    .kiln_cmd()
    .args(["prune", "-o", "json"])
    .assert()
    .success()
    .stdout(predicate::str::contains("bytes_freed"))
    .stdout(predicate::str::contains("deleted_paths"));
}

#[cfg(unix)]
#[test]
fn prune_with_zero_budget_empties_cache() {
  use kiln_lib::graph::{Run, image};

  if !super::common::sandboxed() {
    return;
  }
  let env = TestEnv::new();
  env.seed_image("busybox");
  let st = image("busybox").run(Run::shell("echo hi > /greeting")).root();
  let bytes = super::common::encode(&st);

  env.kiln_cmd().arg("build").write_stdin(bytes.clone()).assert().success();
  env
    .kiln_cmd()
    .args(["prune", "--keep-storage", "0"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Entries removed: 2"));

  env
    .kiln_cmd()
    .args(["build", "--progress=plain"])
    .write_stdin(bytes)
    .assert()
    .success()
    .stdout(predicate::str::contains("Executed: 2"));
}
