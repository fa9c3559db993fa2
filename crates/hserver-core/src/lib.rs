//! # hserver-core
//!
//! Foundation types shared by every crate in the case pipeline:
//!
//! - [`ids`]: branded ID newtypes (`CaseId`, `StudyId`, `ArtifactId`, ...)
//! - [`errors`]: the [`ErrorKind`] taxonomy callers branch on
//! - [`events`]: [`DomainEvent`]s and the synchronous [`EventBus`]
//! - [`logging`]: `tracing` subscriber initialization

#![deny(unsafe_code)]

pub mod errors;
pub mod events;
pub mod ids;
pub mod logging;

pub use errors::ErrorKind;
pub use events::{CollectingListener, DomainEvent, DomainEventListener, EventBus};
pub use ids::{ActorId, ArtifactId, CaseId, EntryId, JobId, StudyId};
