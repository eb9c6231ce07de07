//! `kiln debug` subcommands.

use std::path::Path;

use anyhow::{Context, Result};

use kiln_lib::definition::Definition;

use super::build::read_definition;
use crate::output::print_json;

/// Decode a definition and print its nodes as JSON.
pub fn cmd_debug_dump(path: Option<&Path>) -> Result<()> {
  let bytes = read_definition(path)?;
  let definition = Definition::from_bytes(&bytes).context("Invalid definition")?;
  print_json(&definition.to_json()?)
}
