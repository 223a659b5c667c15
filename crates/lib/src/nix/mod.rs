//! Nix build orchestration.
//!
//! This module provides:
//! - `NixBuilder`: runs `nix build` and collects its JSON result
//! - `LogEntry`: one record of the `internal-json` log protocol
//! - `BuildResult`: the derivation and output paths of one built installable

pub mod builder;
pub mod log;
pub mod types;

pub use builder::{BuildExecutor, LogSink, NixBuilder, build_args};
pub use log::{LogEntry, LogMessage, LogPosition, LogTrace, parse_log_line};
pub use types::{BuildError, BuildResult};
