//! Types for nix build invocations.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One entry of the `nix build --json` result array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
  #[serde(rename = "drvPath")]
  pub derivation_path: String,
  /// Output name (e.g. `out`, `dev`) to its store path.
  #[serde(default)]
  pub outputs: BTreeMap<String, PathBuf>,
}

/// Errors that can occur while running `nix build`.
#[derive(Debug, Error)]
pub enum BuildError {
  /// The build tool could not be started.
  #[error("failed to start {program}: {source}")]
  Spawn {
    program: String,
    #[source]
    source: std::io::Error,
  },

  /// Waiting for the build tool to exit failed.
  #[error("failed to wait for {program}: {source}")]
  Wait {
    program: String,
    #[source]
    source: std::io::Error,
  },

  /// The build tool exited unsuccessfully.
  #[error("{program} exited with code {code:?}")]
  ExitStatus { program: String, code: Option<i32> },

  /// The captured result could not be decoded.
  #[error("failed to parse build result: {0}")]
  Decode(#[source] serde_json::Error),

  /// Reading the build tool's output failed.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  /// No build command is configured.
  #[error("build command is empty")]
  EmptyCommand,

  /// The build was cancelled and the build tool killed.
  #[error("build cancelled")]
  Cancelled,

  /// The build ran past its deadline and the build tool was killed.
  #[error("build timed out after {0:?}")]
  TimedOut(std::time::Duration),
}
