//! Implementation of the `fluxnix build` command.
//!
//! Runs `nix build` with the configured command, streams nix messages to
//! stderr and prints the build results as JSON on stdout.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::debug;

use fluxnix_lib::cancel::CancelToken;
use fluxnix_lib::config::Config;
use fluxnix_lib::nix::{BuildExecutor, LogEntry, NixBuilder};

use crate::output::{format_duration, print_json, print_log_entry, print_success};

/// Nix `info` in normal mode, `chatty` with `--verbose`.
fn max_log_level(verbose: bool) -> u8 {
  if verbose { 5 } else { 3 }
}

pub fn cmd_build(config: Option<&Path>, extra_args: Vec<String>, installables: Vec<String>, verbose: bool) -> Result<()> {
  let config = Config::resolve(config).context("Failed to load configuration")?;
  debug!(config = ?config, "configuration loaded");

  let builder = NixBuilder::with_command(config.build.command.clone()).timeout(config.build.timeout()?);
  let mut args = config.build.extra_args.clone();
  args.extend(extra_args);

  let max_level = max_log_level(verbose);
  let started = Instant::now();

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let results = rt
    .block_on(async {
      let cancel = CancelToken::new();
      super::cancel_on_ctrl_c(&cancel);
      let mut sink = |entry: LogEntry| print_log_entry(&entry, max_level);
      builder.execute(Some(&mut sink), &args, &installables, &cancel).await
    })
    .context("Build failed")?;

  print_success(&format!(
    "Built {} derivation(s) in {}",
    results.len(),
    format_duration(started.elapsed())
  ));
  print_json(&results)
}
