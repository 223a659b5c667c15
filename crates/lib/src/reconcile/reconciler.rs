//! Event handling in front of the pipeline.

use tracing::debug;

use super::{PublishOutcome, ReconcileError, ReconcilePipeline};
use crate::cancel::CancelToken;
use crate::fetch::ArtifactFetcher;
use crate::nix::BuildExecutor;
use crate::publish::Publisher;
use crate::source::{CreateEvent, EventFilter, RevisionChangePredicate, TrackedObject, UpdateEvent};

/// Filters source events and runs the pipeline for the ones that carry a
/// new revision.
///
/// Handlers return `Ok(None)` when an event is filtered out or the object
/// has nothing to build yet.
#[derive(Debug)]
pub struct Reconciler<F, B, P> {
  pipeline: ReconcilePipeline<F, B, P>,
  predicate: RevisionChangePredicate,
}

impl<F, B, P> Reconciler<F, B, P>
where
  F: ArtifactFetcher,
  B: BuildExecutor,
  P: Publisher,
{
  pub fn new(pipeline: ReconcilePipeline<F, B, P>) -> Self {
    Self {
      pipeline,
      predicate: RevisionChangePredicate,
    }
  }

  pub fn pipeline(&self) -> &ReconcilePipeline<F, B, P> {
    &self.pipeline
  }

  pub async fn on_create(
    &self,
    event: &CreateEvent<TrackedObject>,
    cancel: &CancelToken,
  ) -> Result<Option<PublishOutcome>, ReconcileError> {
    match &event.object {
      Some(object) if self.predicate.create(event) => self.reconcile(object, cancel).await,
      _ => {
        debug!("create event filtered");
        Ok(None)
      }
    }
  }

  pub async fn on_update(
    &self,
    event: &UpdateEvent<TrackedObject>,
    cancel: &CancelToken,
  ) -> Result<Option<PublishOutcome>, ReconcileError> {
    match &event.new {
      Some(object) if self.predicate.update(event) => self.reconcile(object, cancel).await,
      _ => {
        debug!("update event filtered");
        Ok(None)
      }
    }
  }

  /// Build and publish the object's current artifact, if it has one.
  pub async fn reconcile(
    &self,
    object: &TrackedObject,
    cancel: &CancelToken,
  ) -> Result<Option<PublishOutcome>, ReconcileError> {
    let Some(artifact) = &object.artifact else {
      debug!(object = %object.meta, "object has no artifact yet");
      return Ok(None);
    };
    self.pipeline.run(&object.meta, artifact, cancel).await.map(Some)
  }
}
