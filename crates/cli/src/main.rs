mod cmd;
mod output;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cmd::{ReconcileArgs, cmd_build, cmd_pack, cmd_reconcile};

/// fluxnix - build nix flakes from source artifacts and publish the results
#[derive(Parser)]
#[command(name = "fluxnix")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Path to the configuration file (default: $XDG_CONFIG_HOME/fluxnix/config.toml)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Run nix build and print the results as JSON
  Build {
    /// Extra argument passed to nix after the fixed flags (repeatable)
    #[arg(long = "extra-arg", value_name = "ARG", allow_hyphen_values = true)]
    extra_args: Vec<String>,

    /// Installables to build, e.g. a flake directory
    #[arg(required = true)]
    installables: Vec<String>,
  },

  /// Package a directory into a deterministic tar.gz archive
  Pack {
    /// Directory to package
    dir: PathBuf,

    /// Archive file to write
    #[arg(short, long)]
    output: PathBuf,
  },

  /// Fetch, build and publish one source artifact
  Reconcile(ReconcileArgs),
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let default_filter = if cli.verbose { "debug" } else { "info" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let config = cli.config.as_deref();
  match cli.command {
    Commands::Build {
      extra_args,
      installables,
    } => cmd_build(config, extra_args, installables, cli.verbose),
    Commands::Pack { dir, output } => cmd_pack(&dir, &output),
    Commands::Reconcile(args) => cmd_reconcile(config, args),
  }
}
