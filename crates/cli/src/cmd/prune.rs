use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use kiln_lib::gc::{PruneOptions, prune};
use kiln_lib::solve::cache::SnapshotCache;
use kiln_lib::store_lock::{LockMode, StoreLock};

use crate::output::{OutputFormat, format_bytes, format_duration, print_info, print_json, print_stat, print_success};

pub fn cmd_prune(
  keep_duration: Option<Duration>,
  keep_bytes: Option<u64>,
  dry_run: bool,
  output: OutputFormat,
  root: Option<PathBuf>,
) -> Result<()> {
  let start = Instant::now();
  let config = super::engine_config(root);

  let _lock = StoreLock::acquire(&config.root, LockMode::Exclusive, "prune").context("Failed to acquire store lock")?;

  let cache = SnapshotCache::open(&config.root);
  let result = prune(
    &cache,
    &PruneOptions {
      keep_duration,
      keep_bytes,
      dry_run,
    },
  )?;

  if output.is_json() {
    print_json(&result)?;
  } else {
    println!();
    if dry_run {
      print_info("Dry run - no changes made");
    } else {
      print_success("Prune complete!");
    }
    print_stat("Entries scanned", &result.stats.scanned.to_string());
    print_stat("Entries removed", &result.stats.deleted.to_string());
    print_stat("Space freed", &format_bytes(result.stats.bytes_freed));
    print_stat("Duration", &format_duration(start.elapsed()));
  }

  Ok(())
}
