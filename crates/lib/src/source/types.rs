//! Types for tracked sources and change events.

use serde::{Deserialize, Serialize};

/// A fetchable, content-verified snapshot of source content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
  /// Where the artifact tarball can be downloaded.
  pub url: String,
  /// Content digest in `<algorithm>:<hex>` form, e.g. `sha256:ab12...`.
  pub digest: String,
  /// The source revision the artifact was produced from.
  pub revision: String,
}

/// Namespaced identity of a tracked object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
  pub namespace: String,
  pub name: String,
}

impl ObjectRef {
  pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
    Self {
      namespace: namespace.into(),
      name: name.into(),
    }
  }
}

impl std::fmt::Display for ObjectRef {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}/{}", self.namespace, self.name)
  }
}

/// Anything that may carry a source artifact.
pub trait Source {
  fn artifact(&self) -> Option<&Artifact>;
}

/// The monitored repository record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedObject {
  #[serde(flatten)]
  pub meta: ObjectRef,
  #[serde(default)]
  pub artifact: Option<Artifact>,
}

impl TrackedObject {
  pub fn new(meta: ObjectRef, artifact: Option<Artifact>) -> Self {
    Self { meta, artifact }
  }
}

impl Source for TrackedObject {
  fn artifact(&self) -> Option<&Artifact> {
    self.artifact.as_ref()
  }
}

/// An object was created.
#[derive(Debug, Clone)]
pub struct CreateEvent<T> {
  pub object: Option<T>,
}

/// An object changed. Either side may be missing if the watcher lost it.
#[derive(Debug, Clone)]
pub struct UpdateEvent<T> {
  pub old: Option<T>,
  pub new: Option<T>,
}

/// An object was deleted.
#[derive(Debug, Clone)]
pub struct DeleteEvent<T> {
  pub object: Option<T>,
}

/// An event of unknown origin, e.g. a periodic resync.
#[derive(Debug, Clone)]
pub struct GenericEvent<T> {
  pub object: Option<T>,
}
