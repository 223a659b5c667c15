//! Implementation of the `fluxnix pack` command.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

use anyhow::{Context, Result, bail};

use fluxnix_lib::archive;

use crate::output::{format_bytes, print_success, symbols};

pub fn cmd_pack(dir: &Path, output: &Path) -> Result<()> {
  if !dir.is_dir() {
    bail!("Not a directory: {}", dir.display());
  }

  let file = File::create(output).with_context(|| format!("Failed to create {}", output.display()))?;
  let writer = archive::compress(dir, BufWriter::new(file))
    .with_context(|| format!("Failed to package {}", dir.display()))?;
  writer
    .into_inner()
    .map_err(|e| e.into_error())
    .with_context(|| format!("Failed to write {}", output.display()))?;

  let size = fs::metadata(output)
    .with_context(|| format!("Failed to stat {}", output.display()))?
    .len();
  print_success(&format!(
    "Packed {} {} {} ({})",
    dir.display(),
    symbols::ARROW,
    output.display(),
    format_bytes(size)
  ));
  Ok(())
}
