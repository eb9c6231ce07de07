mod build;
mod debug;
mod image;
mod prune;

use std::path::PathBuf;

use kiln_lib::session::EngineConfig;

pub use build::{BuildArgs, cmd_build};
pub use debug::cmd_debug_dump;
pub use image::{cmd_image_import, cmd_image_inspect, cmd_image_ls};
pub use prune::cmd_prune;

/// Environment configuration with the `--root` override applied.
fn engine_config(root: Option<PathBuf>) -> EngineConfig {
  let mut config = EngineConfig::from_env();
  if let Some(root) = root {
    config.root = root;
  }
  config
}
