mod cmd;
mod output;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cmd::{BuildArgs, cmd_build, cmd_debug_dump, cmd_image_import, cmd_image_inspect, cmd_image_ls, cmd_prune};
use crate::output::{OutputFormat, print_error};

/// kiln - content-addressed build engine
#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable debug logging
  #[arg(short, long, global = true)]
  verbose: bool,

  /// State root (defaults to KILN_ROOT, then the user data directory)
  #[arg(long, global = true, value_name = "DIR")]
  root: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Solve a definition read from stdin and export the result
  Build(BuildArgs),

  /// Manage the local image store
  Image {
    #[command(subcommand)]
    command: ImageCommands,
  },

  /// Evict snapshot cache entries
  Prune {
    /// Remove entries older than this (e.g. "48h", "7days")
    #[arg(long, value_parser = humantime::parse_duration)]
    keep_duration: Option<Duration>,

    /// Evict oldest entries until the cache is at most this many bytes
    #[arg(long, value_name = "BYTES")]
    keep_storage: Option<u64>,

    /// Show what would be removed without deleting anything
    #[arg(long)]
    dry_run: bool,

    #[arg(short, long, value_enum, default_value_t)]
    output: OutputFormat,
  },

  /// Debugging helpers
  Debug {
    #[command(subcommand)]
    command: DebugCommands,
  },
}

#[derive(Subcommand)]
enum ImageCommands {
  /// Store a directory as an image
  Import { name: String, dir: PathBuf },

  /// List stored images
  Ls {
    #[arg(long, value_enum, default_value_t)]
    format: OutputFormat,
  },

  /// Show an image record
  Inspect {
    name: String,

    /// Also report whether the image is unpacked for this snapshotter
    #[arg(long)]
    snapshotter: Option<String>,
  },
}

#[derive(Subcommand)]
enum DebugCommands {
  /// Decode a definition and print it as JSON
  Dump {
    /// Read the definition from a file instead of stdin
    #[arg(long)]
    definition: Option<PathBuf>,
  },
}

fn main() {
  let cli = Cli::parse();

  let filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "warn" }));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  if let Err(e) = run(cli) {
    print_error(&format!("{:#}", e));
    std::process::exit(1);
  }
}

fn run(cli: Cli) -> Result<()> {
  let root = cli.root;
  match cli.command {
    Commands::Build(args) => cmd_build(args, root),
    Commands::Image { command } => match command {
      ImageCommands::Import { name, dir } => cmd_image_import(&name, &dir, root),
      ImageCommands::Ls { format } => cmd_image_ls(format, root),
      ImageCommands::Inspect { name, snapshotter } => cmd_image_inspect(&name, snapshotter.as_deref(), root),
    },
    Commands::Prune {
      keep_duration,
      keep_storage,
      dry_run,
      output,
    } => cmd_prune(keep_duration, keep_storage, dry_run, output, root),
    Commands::Debug { command } => match command {
      DebugCommands::Dump { definition } => cmd_debug_dump(definition.as_deref()),
    },
  }
}
