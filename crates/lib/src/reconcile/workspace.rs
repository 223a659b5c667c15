//! Scoped build workspaces.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};

/// A uniquely named directory owned by one run.
///
/// The directory and everything below it is removed when the guard drops,
/// including during unwinding. Removal failures are logged and swallowed.
#[derive(Debug)]
pub struct Workspace {
  dir: Option<TempDir>,
  path: PathBuf,
}

impl Workspace {
  /// Create a workspace named `<prefix>-<random>` below `root`, or below the
  /// system temp directory when no root is given.
  pub fn create(prefix: &str, root: Option<&Path>) -> std::io::Result<Self> {
    let prefix = format!("{}-", prefix);
    let mut builder = tempfile::Builder::new();
    builder.prefix(&prefix);

    let dir = match root {
      Some(root) => {
        std::fs::create_dir_all(root)?;
        builder.tempdir_in(root)?
      }
      None => builder.tempdir()?,
    };

    let path = dir.path().to_path_buf();
    debug!(path = %path.display(), "workspace created");
    Ok(Self { dir: Some(dir), path })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl Drop for Workspace {
  fn drop(&mut self) {
    let Some(dir) = self.dir.take() else {
      return;
    };
    match dir.close() {
      Ok(()) => debug!(path = %self.path.display(), "workspace removed"),
      Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove workspace"),
    }
  }
}
