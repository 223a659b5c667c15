//! The fetch → build → package → publish pipeline.
//!
//! A run takes one artifact of one tracked object and turns it into a
//! published archive of the build's `out` output:
//!
//! 1. Create a private workspace
//! 2. Fetch and unpack the artifact into it
//! 3. Build the workspace as a flake
//! 4. Package the `out` store path
//! 5. Upload the archive under a key derived from the object and revision
//!
//! The workspace is removed when the run ends, whatever the outcome.

pub mod pipeline;
pub mod reconciler;
pub mod workspace;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::archive::PackError;
use crate::consts::ARCHIVE_EXTENSION;
use crate::fetch::FetchError;
use crate::nix::BuildError;
use crate::publish::PublishError;
use crate::source::ObjectRef;

pub use pipeline::ReconcilePipeline;
pub use reconciler::Reconciler;
pub use workspace::Workspace;

/// Where a run currently is, or where it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
  Idle,
  Fetching,
  Building,
  Packaging,
  Publishing,
  Done,
  Failed,
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Stage::Idle => "idle",
      Stage::Fetching => "fetching",
      Stage::Building => "building",
      Stage::Packaging => "packaging",
      Stage::Publishing => "publishing",
      Stage::Done => "done",
      Stage::Failed => "failed",
    };
    f.write_str(name)
  }
}

/// Errors that end a reconcile run.
#[derive(Debug, Error)]
pub enum ReconcileError {
  #[error("failed to create workspace: {0}")]
  Workspace(#[source] std::io::Error),

  #[error("fetch failed: {0}")]
  FetchFailed(#[from] FetchError),

  #[error("build failed: {0}")]
  BuildFailed(#[from] BuildError),

  #[error("expected exactly one build result, got {0}")]
  UnexpectedResultCount(usize),

  #[error("build result for {derivation} has no \"out\" output")]
  MissingOutput { derivation: String },

  #[error("packaging failed: {0}")]
  PackagingFailed(#[from] PackError),

  #[error("publish failed: {0}")]
  PublishFailed(#[from] PublishError),

  /// The run's cancel token fired before or during `stage`.
  #[error("cancelled while {stage}")]
  Cancelled { stage: Stage },
}

impl ReconcileError {
  /// The stage the run was in when it failed.
  pub fn stage(&self) -> Stage {
    match self {
      ReconcileError::Workspace(_) => Stage::Idle,
      ReconcileError::FetchFailed(_) => Stage::Fetching,
      ReconcileError::BuildFailed(_) | ReconcileError::UnexpectedResultCount(_) | ReconcileError::MissingOutput { .. } => {
        Stage::Building
      }
      ReconcileError::PackagingFailed(_) => Stage::Packaging,
      ReconcileError::PublishFailed(_) => Stage::Publishing,
      ReconcileError::Cancelled { stage } => *stage,
    }
  }
}

/// What a successful run published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOutcome {
  pub bucket: String,
  pub key: String,
  /// Version identifier assigned by the object store.
  pub version: String,
  /// Archive size in bytes.
  pub size: u64,
}

/// Object key for an archive: `<namespace>/<name>/<revision>.tar.gz`.
///
/// Characters outside `[A-Za-z0-9._-]` in the revision are replaced by `_`,
/// so revisions such as `main@sha1:abc` stay a single path segment.
pub fn object_key(object: &ObjectRef, revision: &str) -> String {
  let revision: String = revision
    .chars()
    .map(|c| {
      if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
        c
      } else {
        '_'
      }
    })
    .collect();
  let revision = match revision.as_str() {
    "" | "." | ".." => format!("_{}", revision),
    _ => revision,
  };
  format!("{}/{}/{}.{}", object.namespace, object.name, revision, ARCHIVE_EXTENSION)
}
