//! Test utilities for fluxnix-lib.
//!
//! Fake build tools are plain shell scripts run through `/bin/sh`, so tests
//! never need a real nix installation.

use tempfile::TempDir;

use crate::nix::NixBuilder;

/// A builder wired to a shell script instead of nix.
pub struct FakeNix {
  pub dir: TempDir,
  pub builder: NixBuilder,
}

/// Write `script` to a temp directory and return a builder that runs it.
///
/// The script receives the full nix argument vector as `"$@"`.
pub fn fake_nix(script: &str) -> FakeNix {
  let dir = TempDir::new().unwrap();
  let path = dir.path().join("nix.sh");
  std::fs::write(&path, script).unwrap();

  let builder = NixBuilder::with_command(vec!["/bin/sh".to_string(), path.to_string_lossy().to_string()]);
  FakeNix { dir, builder }
}
