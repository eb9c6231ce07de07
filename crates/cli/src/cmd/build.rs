//! Implementation of the `kiln build` command.
//!
//! Reads an encoded definition, solves it and runs the requested exporters.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Args;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use kiln_lib::cancel::CancelToken;
use kiln_lib::export::{ExportConfig, ExportPolicy};
use kiln_lib::progress::ProgressEvent;
use kiln_lib::session::{BuildRequest, Engine};

use crate::output::{
  ProgressMode, format_duration, print_progress, print_stat, print_success, print_warning, symbols, truncate_hash,
};

#[derive(Debug, Args)]
pub struct BuildArgs {
  /// Progress output on stderr
  #[arg(long, value_enum, default_value_t)]
  progress: ProgressMode,

  /// Bind a local source, e.g. `--local src=./project`
  #[arg(long = "local", value_name = "NAME=DIR")]
  locals: Vec<String>,

  /// Exporter kind (`local` or `image`)
  #[arg(long)]
  exporter: Option<String>,

  /// Option for `--exporter`, repeatable
  #[arg(long = "exporter-opt", value_name = "KEY=VALUE", requires = "exporter")]
  exporter_opts: Vec<String>,

  /// Exporter as CSV, e.g. `type=image,name=example.com/app:dev`; repeatable
  #[arg(long = "output", short = 'o', value_name = "CSV")]
  outputs: Vec<String>,

  /// Write the export metadata record here as JSON
  #[arg(long)]
  metadata_file: Option<PathBuf>,

  /// Cancel the build after this long (e.g. "90s", "5m")
  #[arg(long, value_parser = humantime::parse_duration)]
  timeout: Option<Duration>,

  /// Abort remaining exporters after the first export failure
  #[arg(long)]
  fail_fast: bool,

  /// Read the definition from a file instead of stdin
  #[arg(long)]
  definition: Option<PathBuf>,

  /// Maximum number of nodes executing at once
  #[arg(long)]
  parallelism: Option<usize>,
}

pub fn cmd_build(args: BuildArgs, root: Option<PathBuf>) -> Result<()> {
  let start = Instant::now();
  let request = build_request(&args)?;

  let mut config = super::engine_config(root);
  if let Some(parallelism) = args.parallelism.filter(|n| *n > 0) {
    config.parallelism = parallelism;
  }
  debug!(root = ?config.root, parallelism = config.parallelism, "starting build");

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let outcome = rt.block_on(async {
    let engine = Engine::new(config);
    let mut events = engine.subscribe();
    let mode = args.progress;

    let printer = tokio::spawn(async move {
      loop {
        match events.recv().await {
          Ok(event) => {
            let done = matches!(event, ProgressEvent::BuildCompleted { .. });
            print_progress(&event, mode);
            if done {
              break;
            }
          }
          Err(RecvError::Lagged(skipped)) => debug!(skipped, "progress output lagged"),
          Err(RecvError::Closed) => break,
        }
      }
    });

    let cancel = CancelToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        print_warning("Interrupted, cancelling build");
        on_signal.cancel();
      }
    });

    let outcome = engine.build(request, &cancel).await;
    let _ = printer.await;
    outcome
  });

  let outcome = outcome.context("Build failed")?;

  println!();
  print_success("Build complete!");
  print_stat("Executed", &outcome.executed.len().to_string());
  print_stat("Cached", &outcome.cached.len().to_string());
  for export in &outcome.exports {
    print_stat(
      &format!("Export {}", export.kind),
      &format!("{} {} {}", export.target, symbols::ARROW, truncate_hash(export.digest.as_str())),
    );
  }
  if let Some(path) = &args.metadata_file {
    print_stat("Metadata", &path.display().to_string());
  }
  print_stat("Duration", &format_duration(start.elapsed()));

  Ok(())
}

fn build_request(args: &BuildArgs) -> Result<BuildRequest> {
  let definition = read_definition(args.definition.as_deref())?;
  let mut request = BuildRequest::new(definition);

  request.locals = parse_locals(&args.locals)?;

  if let Some(kind) = &args.exporter {
    request
      .exports
      .push(ExportConfig::from_legacy(kind, &args.exporter_opts).context("Invalid --exporter-opt")?);
  }
  for output in &args.outputs {
    request
      .exports
      .push(ExportConfig::parse_csv(output).with_context(|| format!("Invalid --output {:?}", output))?);
  }

  request.metadata_file = args.metadata_file.clone();
  request.timeout = args.timeout;
  if args.fail_fast {
    request.export_policy = ExportPolicy::FailFast;
  }

  Ok(request)
}

/// Read an encoded definition from `path`, or from stdin when `None`.
pub(super) fn read_definition(path: Option<&Path>) -> Result<Vec<u8>> {
  match path {
    Some(path) => std::fs::read(path).with_context(|| format!("Failed to read definition {}", path.display())),
    None => {
      let mut bytes = Vec::new();
      std::io::stdin()
        .read_to_end(&mut bytes)
        .context("Failed to read definition from stdin")?;
      if bytes.is_empty() {
        bail!("No definition on stdin");
      }
      Ok(bytes)
    }
  }
}

fn parse_locals(pairs: &[String]) -> Result<BTreeMap<String, PathBuf>> {
  let mut locals = BTreeMap::new();
  for pair in pairs {
    let Some((name, dir)) = pair.split_once('=') else {
      bail!("Invalid --local {:?}, expected NAME=DIR", pair);
    };
    if name.is_empty() || dir.is_empty() {
      bail!("Invalid --local {:?}, expected NAME=DIR", pair);
    }
    let dir = Path::new(dir);
    if !dir.is_dir() {
      bail!("Local source {:?} is not a directory: {}", name, dir.display());
    }
    let dir = dunce::canonicalize(dir).with_context(|| format!("Failed to resolve {}", dir.display()))?;
    locals.insert(name.to_string(), dir);
  }
  Ok(locals)
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn parse_locals_accepts_name_dir() {
    let temp = TempDir::new().unwrap();
    let pair = format!("src={}", temp.path().display());
    let locals = parse_locals(&[pair]).unwrap();
    assert_eq!(locals["src"], dunce::canonicalize(temp.path()).unwrap());
  }

  #[test]
  fn parse_locals_rejects_malformed() {
    assert!(parse_locals(&["src".to_string()]).is_err());
    assert!(parse_locals(&["=dir".to_string()]).is_err());
    assert!(parse_locals(&["src=/definitely/not/here".to_string()]).is_err());
  }
}
