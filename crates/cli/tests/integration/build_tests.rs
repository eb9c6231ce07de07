#![cfg(unix)]

use std::collections::BTreeMap;

use predicates::prelude::*;

use kiln_lib::graph::{MountMode, Run, State, image, local, scratch};

use super::common::{TestEnv, encode, sandboxed};

const BASE: &str = "busybox";

/// Writes `bar` into `/out/foo` on a scratch mount and returns that mount.
fn foo_bar() -> State {
  image(BASE)
    .run(Run::shlex("sh -c 'echo -n bar > /out/foo'").mount("/out", scratch(), MountMode::ReadWrite))
    .get_mount("/out")
}

#[test]
fn build_with_local_source() {
  if !sandboxed() {
    return;
  }
  let env = TestEnv::new();
  env.seed_image(BASE);
  env.write_file("src/foo", "bar");

  let st = image(BASE)
    .run(Run::shlex("sh -c 'echo -n bar > /foo2'"))
    .run(Run::shlex("cmp -s /mnt/foo /foo2").mount("/mnt", local("src"), MountMode::ReadOnly))
    .root();

  env
    .kiln_cmd()
    .args(["build", "--progress=plain", "--local"])
    .arg(format!("src={}", env.path("src").display()))
    .write_stdin(encode(&st))
    .assert()
    .success()
    .stderr(predicate::str::contains("cmp -s /mnt/foo /foo2"));

  assert_eq!(std::fs::read_to_string(env.path("src/foo")).unwrap(), "bar");
}

#[test]
fn build_local_exporter() {
  if !sandboxed() {
    return;
  }
  let env = TestEnv::new();
  env.seed_image(BASE);
  let out = env.path("out");

  env
    .kiln_cmd()
    .args(["build", "--progress=plain", "--exporter=local", "--exporter-opt"])
    .arg(format!("output={}", out.display()))
    .write_stdin(encode(&foo_bar()))
    .assert()
    .success();

  assert_eq!(std::fs::read_to_string(out.join("foo")).unwrap(), "bar");
}

#[test]
fn build_image_exporter_unpacks() {
  if !sandboxed() {
    return;
  }
  let env = TestEnv::new();
  env.seed_image(BASE);
  let name = "example.com/moby/imageexporter:test";

  env
    .kiln_cmd()
    .args(["build", "--progress=plain", "--exporter=image"])
    .args(["--exporter-opt", "unpack=true"])
    .args(["--exporter-opt", &format!("name={}", name)])
    .write_stdin(encode(&foo_bar()))
    .assert()
    .success();

  let inspected = env.inspect(name, Some("overlayfs"));
  assert_eq!(inspected["is_unpacked"], true);
}

#[test]
fn build_metadata_file_matches_image_store() {
  if !sandboxed() {
    return;
  }
  let env = TestEnv::new();
  env.seed_image(BASE);
  let name = "example.com/moby/metadata:test";
  let metadata_file = env.path("metadata.json");

  env
    .kiln_cmd()
    .args(["build", "--progress=plain", "--output"])
    .arg(format!("type=image,name={},push=false", name))
    .arg("--metadata-file")
    .arg(&metadata_file)
    .write_stdin(encode(&foo_bar()))
    .assert()
    .success();

  let metadata: BTreeMap<String, String> =
    serde_json::from_slice(&std::fs::read(&metadata_file).unwrap()).unwrap();
  assert_eq!(metadata["image.name"], name);
  assert!(!metadata["containerimage.digest"].is_empty());

  let inspected = env.inspect(name, None);
  assert_eq!(inspected["digest"], metadata["containerimage.digest"].as_str());
}

#[test]
fn local_and_image_exporters_in_one_build() {
  if !sandboxed() {
    return;
  }
  let env = TestEnv::new();
  env.seed_image(BASE);
  let out = env.path("out");
  let metadata_file = env.path("metadata.json");

  env
    .kiln_cmd()
    .arg("build")
    .arg("--output")
    .arg(format!("type=local,dest={}", out.display()))
    .args(["--output", "type=image,name=example.com/a:1"])
    .args(["--output", "type=image,name=example.com/b:1"])
    .arg("--metadata-file")
    .arg(&metadata_file)
    .write_stdin(encode(&foo_bar()))
    .assert()
    .success();

  assert_eq!(std::fs::read_to_string(out.join("foo")).unwrap(), "bar");
  let metadata: BTreeMap<String, String> =
    serde_json::from_slice(&std::fs::read(&metadata_file).unwrap()).unwrap();
  assert_eq!(metadata["image.name"], "example.com/a:1,example.com/b:1");
  assert_eq!(env.inspect("example.com/b:1", None)["digest"], metadata["containerimage.digest"].as_str());
}

#[test]
fn rebuild_is_cached() {
  if !sandboxed() {
    return;
  }
  let env = TestEnv::new();
  env.seed_image(BASE);
  let bytes = encode(&foo_bar());

  env.kiln_cmd().arg("build").write_stdin(bytes.clone()).assert().success();
  env
    .kiln_cmd()
    .args(["build", "--progress=plain"])
    .write_stdin(bytes)
    .assert()
    .success()
    .stderr(predicate::str::contains("CACHED"))
    .stdout(predicate::str::contains("Executed: 0"));
}

#[test]
fn failing_command_fails_build_without_metadata() {
  if !sandboxed() {
    return;
  }
  let env = TestEnv::new();
  env.seed_image(BASE);
  let metadata_file = env.path("metadata.json");
  let st = image(BASE).run(Run::shell("exit 7")).root();

  env
    .kiln_cmd()
    .args(["build", "--output", "type=image,name=example.com/x:fail"])
    .arg("--metadata-file")
    .arg(&metadata_file)
    .write_stdin(encode(&st))
    .assert()
    .failure()
    .stderr(predicate::str::contains("exit 7"));

  assert!(!metadata_file.exists());
}

#[test]
fn missing_local_source_is_reported() {
  let env = TestEnv::new();
  env.seed_image(BASE);
  let st = image(BASE)
    .run(Run::shell("true").mount("/mnt", local("src"), MountMode::ReadOnly))
    .root();

  env
    .kiln_cmd()
    .arg("build")
    .write_stdin(encode(&st))
    .assert()
    .failure()
    .stderr(predicate::str::contains("\"src\""));
}

#[test]
fn missing_base_image_is_reported() {
  let env = TestEnv::new();
  let st = image("example.com/nope:latest").run(Run::shell("true")).root();

  env
    .kiln_cmd()
    .arg("build")
    .write_stdin(encode(&st))
    .assert()
    .failure()
    .stderr(predicate::str::contains("image not found"));
}

#[test]
fn push_is_rejected() {
  let env = TestEnv::new();
  env.seed_image(BASE);

  env
    .kiln_cmd()
    .args(["build", "--output", "type=image,name=example.com/x:push,push=true"])
    .write_stdin(encode(&foo_bar()))
    .assert()
    .failure()
    .stderr(predicate::str::contains("push"));
}

#[test]
fn unknown_exporter_is_rejected() {
  let env = TestEnv::new();
  env.seed_image(BASE);

  env
    .kiln_cmd()
    .args(["build", "--exporter=registry"])
    .write_stdin(encode(&foo_bar()))
    .assert()
    .failure()
    .stderr(predicate::str::contains("unknown exporter type"));
}

#[test]
fn garbage_definition_is_rejected() {
  let env = TestEnv::new();

  env
    .kiln_cmd()
    .arg("build")
    .write_stdin("definitely not a definition")
    .assert()
    .failure()
    .stderr(predicate::str::contains("invalid definition"));
}

#[test]
fn timeout_cancels_build() {
  if !sandboxed() {
    return;
  }
  let env = TestEnv::new();
  env.seed_image(BASE);
  let st = image(BASE).run(Run::shell("sleep 30")).root();

  env
    .kiln_cmd()
    .args(["build", "--timeout", "300ms"])
    .write_stdin(encode(&st))
    .assert()
    .failure()
    .stderr(predicate::str::contains("cancelled"));
}

#[test]
fn debug_dump_prints_nodes() {
  let env = TestEnv::new();

  env
    .kiln_cmd()
    .args(["debug", "dump"])
    .write_stdin(encode(&foo_bar()))
    .assert()
    .success()
    .stdout(predicate::str::contains("\"nodes\""))
    .stdout(predicate::str::contains("busybox"));
}
