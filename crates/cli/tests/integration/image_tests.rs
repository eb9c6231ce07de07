use predicates::prelude::*;

use super::common::TestEnv;

#[test]
fn import_then_list() {
  let env = TestEnv::new();
  env.write_file("tree/etc/hostname", "kiln\n");

  env
    .kiln_cmd()
    .args(["image", "import", "example.com/base:1"])
    .arg(env.path("tree"))
    .assert()
    .success()
    .stdout(predicate::str::contains("sha256:"));

  env
    .kiln_cmd()
    .args(["image", "ls"])
    .assert()
    .success()
    .stdout(predicate::str::contains("example.com/base:1"));
}

#[test]
fn list_json_is_valid() {
  let env = TestEnv::new();
  env.seed_image("busybox");

  let output = env.kiln_cmd().args(["image", "ls", "--format", "json"]).output().unwrap();
  assert!(output.status.success());
  let images: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(images[0]["name"], "busybox");
}

#[test]
fn importing_same_tree_twice_keeps_digest() {
  let env = TestEnv::new();
  env.write_file("tree/file", "same");

  env.kiln_cmd().args(["image", "import", "a"]).arg(env.path("tree")).assert().success();
  let first = env.inspect("a", None)["digest"].clone();
  env.kiln_cmd().args(["image", "import", "a"]).arg(env.path("tree")).assert().success();
  let second = env.inspect("a", None)["digest"].clone();

  assert_eq!(first, second);
}

#[test]
fn inspect_unknown_image_fails() {
  let env = TestEnv::new();

  env
    .kiln_cmd()
    .args(["image", "inspect", "nope"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("image not found"));
}

#[test]
fn inspect_reports_not_unpacked() {
  let env = TestEnv::new();
  env.seed_image("busybox");

  let inspected = env.inspect("busybox", Some("overlayfs"));
  assert_eq!(inspected["is_unpacked"], false);
}
