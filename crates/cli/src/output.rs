//! CLI output formatting utilities.
//!
//! Provides consistent formatting for terminal output including colored status
//! messages, human-readable byte/duration formatting, and Unicode symbols.

use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use kiln_lib::progress::ProgressEvent;
use owo_colors::{OwoColorize, Stream};

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

/// How `kiln build` renders progress events on stderr.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ProgressMode {
  /// Colored when stderr supports it.
  #[default]
  Auto,
  Plain,
  Quiet,
}

pub mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
  pub const WARNING: &str = "⚠";
  pub const INFO: &str = "•";
  pub const ARROW: &str = "→";
}

/// Shorten a `sha256:<hex>` digest to the first 12 hex characters.
pub fn truncate_hash(hash: &str) -> &str {
  let hex = hash.strip_prefix("sha256:").unwrap_or(hash);
  let len = hex.len().min(12);
  &hex[..len]
}

pub fn format_bytes(bytes: u64) -> String {
  const KB: u64 = 1024;
  const MB: u64 = KB * 1024;
  const GB: u64 = MB * 1024;

  if bytes >= GB {
    format!("{:.1} GB", bytes as f64 / GB as f64)
  } else if bytes >= MB {
    format!("{:.1} MB", bytes as f64 / MB as f64)
  } else if bytes >= KB {
    format!("{:.1} KB", bytes as f64 / KB as f64)
  } else {
    format!("{} B", bytes)
  }
}

pub fn format_duration(duration: Duration) -> String {
  let secs = duration.as_secs();
  let millis = duration.subsec_millis();

  if secs >= 60 {
    let mins = secs / 60;
    let remaining_secs = secs % 60;
    format!("{}m {}s", mins, remaining_secs)
  } else if secs > 0 {
    format!("{}.{:02}s", secs, millis / 10)
  } else {
    format!("{}ms", millis)
  }
}

pub fn print_success(message: &str) {
  println!(
    "{} {}",
    symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()),
    message
  );
}

pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    symbols::ERROR.if_supports_color(Stream::Stderr, |s| s.red()),
    message.if_supports_color(Stream::Stderr, |s| s.red())
  );
}

pub fn print_warning(message: &str) {
  eprintln!(
    "{} {}",
    symbols::WARNING.if_supports_color(Stream::Stderr, |s| s.yellow()),
    message.if_supports_color(Stream::Stderr, |s| s.yellow())
  );
}

pub fn print_info(message: &str) {
  println!(
    "{} {}",
    symbols::INFO.if_supports_color(Stream::Stdout, |s| s.blue()),
    message
  );
}

pub fn print_stat(label: &str, value: &str) {
  println!(
    "  {}: {}",
    label.if_supports_color(Stream::Stdout, |s| s.dimmed()),
    value
  );
}

/// Render one progress event on stderr.
pub fn print_progress(event: &ProgressEvent, mode: ProgressMode) {
  let line = event.plain_line();
  match mode {
    ProgressMode::Quiet => {}
    ProgressMode::Plain => eprintln!("{}", line),
    ProgressMode::Auto => match event {
      ProgressEvent::NodeFailed { .. } | ProgressEvent::ExportFailed { .. } => {
        eprintln!("{}", line.if_supports_color(Stream::Stderr, |s| s.red()))
      }
      ProgressEvent::NodeCached { .. } | ProgressEvent::NodeSkipped { .. } => {
        eprintln!("{}", line.if_supports_color(Stream::Stderr, |s| s.dimmed()))
      }
      ProgressEvent::NodeCompleted { .. } | ProgressEvent::ExportCompleted { .. } => {
        eprintln!("{}", line.if_supports_color(Stream::Stderr, |s| s.green()))
      }
      _ => eprintln!("{}", line),
    },
  }
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{}", json);
  Ok(())
}
