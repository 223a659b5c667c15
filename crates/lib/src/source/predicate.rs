//! Event filtering.
//!
//! Filters decide which events reach the reconcile pipeline. They are pure
//! functions of the event payload and never perform I/O.

use super::types::{CreateEvent, DeleteEvent, GenericEvent, Source, UpdateEvent};

/// Decides, per event kind, whether an event should be reconciled.
///
/// Every method defaults to "no match", so an implementation only overrides
/// the event kinds it cares about.
pub trait EventFilter<T> {
  fn create(&self, _event: &CreateEvent<T>) -> bool {
    false
  }

  fn update(&self, _event: &UpdateEvent<T>) -> bool {
    false
  }

  fn delete(&self, _event: &DeleteEvent<T>) -> bool {
    false
  }

  fn generic(&self, _event: &GenericEvent<T>) -> bool {
    false
  }
}

/// Matches events that carry new source content.
///
/// - create: the object already has an artifact
/// - update: an artifact appeared, or its revision changed
#[derive(Debug, Clone, Copy, Default)]
pub struct RevisionChangePredicate;

impl<T: Source> EventFilter<T> for RevisionChangePredicate {
  fn create(&self, event: &CreateEvent<T>) -> bool {
    event.object.as_ref().is_some_and(|obj| obj.artifact().is_some())
  }

  fn update(&self, event: &UpdateEvent<T>) -> bool {
    let (Some(old), Some(new)) = (event.old.as_ref(), event.new.as_ref()) else {
      return false;
    };

    match (old.artifact(), new.artifact()) {
      (None, Some(_)) => true,
      (Some(old), Some(new)) => old.revision != new.revision,
      _ => false,
    }
  }
}
