//! Tracked sources and the events that describe changes to them.
//!
//! A tracked object is the cluster-resident record for one monitored
//! repository. Its artifact, when present, names exactly one fetchable,
//! digest-verified snapshot of the source at a revision.

pub mod predicate;
pub mod types;

pub use predicate::{EventFilter, RevisionChangePredicate};
pub use types::{Artifact, CreateEvent, DeleteEvent, GenericEvent, ObjectRef, Source, TrackedObject, UpdateEvent};
