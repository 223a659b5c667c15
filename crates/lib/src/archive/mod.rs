//! Deterministic tar.gz packaging.
//!
//! `compress` walks a directory depth-first with entries sorted by file name
//! and writes a gzip-compressed tar stream. Headers are written in
//! deterministic mode (fixed mtime, uid/gid 0, normalized permissions), so
//! identical trees always produce identical bytes.
//!
//! `unpack` is the inverse and is used for fetched source artifacts.

use std::fs::{self, File, Metadata};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use flate2::Compression;
use flate2::GzBuilder;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tar::{Archive, Builder, EntryType, Header, HeaderMode};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

/// Errors that can occur while packing or unpacking an archive.
#[derive(Debug, Error)]
pub enum PackError {
  /// An entry path is empty, absolute, uses backslashes or contains `..`.
  #[error("archive path escapes its root: {0:?}")]
  PathTraversal(String),

  #[error("not a directory: {}", .0.display())]
  NotADirectory(PathBuf),

  #[error("path is not valid UTF-8: {}", .0.display())]
  NonUtf8Path(PathBuf),

  #[error("failed to walk directory: {0}")]
  Walk(#[from] walkdir::Error),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  /// The blocking packaging task panicked or was cancelled.
  #[error("packaging task failed: {0}")]
  Task(String),
}

/// Check that `path` is a forward-slash path that stays inside the archive root.
pub fn validate_rel_path(path: &str) -> Result<(), PackError> {
  if path.is_empty() || path.contains('\\') || path.starts_with('/') || path.split('/').any(|segment| segment == "..") {
    return Err(PackError::PathTraversal(path.to_string()));
  }
  Ok(())
}

/// Streams validated entries into a gzip-compressed tar archive.
pub struct ArchiveWriter<W: Write> {
  builder: Builder<GzEncoder<W>>,
}

impl<W: Write> ArchiveWriter<W> {
  pub fn new(sink: W) -> Self {
    let encoder = GzBuilder::new().mtime(0).write(sink, Compression::default());
    let mut builder = Builder::new(encoder);
    builder.mode(HeaderMode::Deterministic);
    builder.follow_symlinks(false);
    Self { builder }
  }

  pub fn append_dir(&mut self, rel_path: &str, meta: &Metadata) -> Result<(), PackError> {
    validate_rel_path(rel_path)?;
    let mut header = header_for(meta, EntryType::Directory, 0);
    self.builder.append_data(&mut header, rel_path, std::io::empty())?;
    Ok(())
  }

  /// Append a regular file. Content is streamed from `path`, never buffered whole.
  pub fn append_file(&mut self, rel_path: &str, path: &Path, meta: &Metadata) -> Result<(), PackError> {
    validate_rel_path(rel_path)?;
    let file = File::open(path)?;
    let mut header = header_for(meta, EntryType::Regular, meta.len());
    self.builder.append_data(&mut header, rel_path, file)?;
    Ok(())
  }

  pub fn append_symlink(&mut self, rel_path: &str, target: &Path, meta: &Metadata) -> Result<(), PackError> {
    validate_rel_path(rel_path)?;
    let mut header = header_for(meta, EntryType::Symlink, 0);
    self.builder.append_link(&mut header, rel_path, target)?;
    Ok(())
  }

  /// Write the tar trailer, flush the compressor and hand back the sink.
  pub fn finish(self) -> Result<W, PackError> {
    let encoder = self.builder.into_inner()?;
    Ok(encoder.finish()?)
  }
}

fn header_for(meta: &Metadata, entry_type: EntryType, size: u64) -> Header {
  let mut header = Header::new_gnu();
  header.set_metadata_in_mode(meta, HeaderMode::Deterministic);
  header.set_entry_type(entry_type);
  header.set_size(size);
  header
}

/// Package every entry below `root` into `sink`.
///
/// The root itself is not an entry; paths are relative to it. Directories
/// precede their contents and siblings appear in lexical order. Sockets,
/// devices and other special files are skipped. A `root` that is not a
/// directory is an error rather than an empty archive.
pub fn compress<W: Write>(root: &Path, sink: W) -> Result<W, PackError> {
  if !fs::metadata(root)?.is_dir() {
    return Err(PackError::NotADirectory(root.to_path_buf()));
  }

  let mut writer = ArchiveWriter::new(sink);
  let mut entries = 0usize;

  for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
    let entry = entry?;
    let rel_path = relative_path(root, entry.path())?;
    let file_type = entry.file_type();
    let meta = entry.metadata()?;

    if file_type.is_dir() {
      writer.append_dir(&rel_path, &meta)?;
    } else if file_type.is_file() {
      writer.append_file(&rel_path, entry.path(), &meta)?;
    } else if file_type.is_symlink() {
      let target = fs::read_link(entry.path())?;
      writer.append_symlink(&rel_path, &target, &meta)?;
    } else {
      debug!(path = %rel_path, "skipping special file");
      continue;
    }
    entries += 1;
  }

  let sink = writer.finish()?;
  debug!(root = %root.display(), entries, "archive written");
  Ok(sink)
}

/// `path` relative to `root`, joined with forward slashes.
fn relative_path(root: &Path, path: &Path) -> Result<String, PackError> {
  let rel = path
    .strip_prefix(root)
    .map_err(|_| PackError::PathTraversal(path.display().to_string()))?;

  let mut parts = Vec::new();
  for component in rel.components() {
    match component {
      Component::Normal(part) => {
        let part = part.to_str().ok_or_else(|| PackError::NonUtf8Path(path.to_path_buf()))?;
        parts.push(part);
      }
      _ => return Err(PackError::PathTraversal(rel.display().to_string())),
    }
  }

  Ok(parts.join("/"))
}

/// Unpack a gzip-compressed tar stream into `dest`.
///
/// Every entry path is validated before anything is written for it.
/// Returns the number of entries unpacked.
pub fn unpack<R: Read>(reader: R, dest: &Path) -> Result<usize, PackError> {
  fs::create_dir_all(dest)?;

  let mut archive = Archive::new(GzDecoder::new(reader));
  let mut count = 0usize;

  for entry in archive.entries()? {
    let mut entry = entry?;
    let path = entry.path()?.into_owned();
    let name = path.to_str().ok_or_else(|| PackError::NonUtf8Path(path.clone()))?;
    let name = name.trim_end_matches('/');

    // Some producers emit a bare `./` entry for the root.
    if name == "." {
      continue;
    }
    validate_rel_path(name)?;

    if !entry.unpack_in(dest)? {
      return Err(PackError::PathTraversal(name.to_string()));
    }
    count += 1;
  }

  debug!(dest = %dest.display(), entries = count, "archive unpacked");
  Ok(count)
}
