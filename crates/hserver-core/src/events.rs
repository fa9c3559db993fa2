//! Domain events and the listener bus.
//!
//! State-changing operations return normally and, once their transaction has
//! committed, publish [`DomainEvent`]s to every registered
//! [`DomainEventListener`]. Listeners run synchronously on the caller's
//! thread. Work that rolled back never produces an event.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ids::{ActorId, ArtifactId, CaseId, EntryId, JobId, StudyId};

/// Something that happened in the pipeline that outside systems care about.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum DomainEvent {
    /// A case was created and its credit spent.
    CaseCreated {
        /// New case.
        case_id: CaseId,
        /// Study the case was created against.
        study_id: StudyId,
        /// Owner of the case.
        owner: ActorId,
        /// Ledger entry for the spend.
        entry_id: EntryId,
    },
    /// A case moved to DONE or REJECT.
    CaseTransitioned {
        /// Case.
        case_id: CaseId,
        /// Previous status.
        from: String,
        /// New status.
        to: String,
    },
    /// A case was cancelled and its credit refunded.
    CaseCancelled {
        /// Case.
        case_id: CaseId,
        /// Ledger entry for the refund.
        refund_entry_id: EntryId,
    },
    /// A case was soft-deleted.
    CaseDeleted {
        /// Case.
        case_id: CaseId,
    },
    /// A file was attached to an empty artifact record.
    ArtifactAttached {
        /// Artifact.
        artifact_id: ArtifactId,
        /// Owning study.
        study_id: StudyId,
        /// Result version, if the artifact is versioned.
        version: Option<u32>,
    },
    /// A present file was replaced by a new one.
    ArtifactReplaced {
        /// Artifact.
        artifact_id: ArtifactId,
        /// Owning study.
        study_id: StudyId,
        /// New result version, if the artifact is versioned.
        version: Option<u32>,
    },
    /// An artifact's file was released.
    ArtifactDeleted {
        /// Artifact.
        artifact_id: ArtifactId,
        /// Bytes no longer counted as used.
        freed_bytes: u64,
    },
    /// Credit was added.
    CreditAllocated {
        /// Ledger entry.
        entry_id: EntryId,
        /// Units added.
        quantity: i64,
        /// Balance after the allocation.
        balance: i64,
    },
    /// Unused credit was withdrawn by an administrator.
    CreditReclaimed {
        /// Ledger entry.
        entry_id: EntryId,
        /// Units withdrawn.
        quantity: i64,
        /// Balance after the withdrawal.
        balance: i64,
    },
    /// A prior spend was refunded.
    CreditRefunded {
        /// Ledger entry.
        entry_id: EntryId,
        /// Case the refund relates to.
        subject: Option<CaseId>,
        /// Units refunded.
        quantity: i64,
    },
    /// A spend was rejected because the balance was too low.
    CreditInsufficient {
        /// Who attempted the spend.
        actor: Option<ActorId>,
        /// Units requested.
        requested: i64,
        /// Balance at the time of the attempt.
        balance: i64,
    },
    /// A spend brought the balance down to the shortage threshold.
    CreditShortage {
        /// Balance after the spend.
        balance: i64,
        /// Configured threshold.
        threshold: i64,
    },
    /// Free storage dropped below the configured threshold.
    LowStorage {
        /// Free bytes.
        free: u64,
        /// Configured threshold.
        threshold: u64,
    },
    /// An upload job was registered and given a huId.
    UploadJobCreated {
        /// Job.
        job_id: JobId,
        /// Assigned business identifier.
        hu_id: String,
    },
    /// An upload job produced a study.
    UploadJobMaterialized {
        /// Job.
        job_id: JobId,
        /// Resulting study.
        study_id: StudyId,
    },
    /// An upload job was rejected.
    UploadJobRejected {
        /// Job.
        job_id: JobId,
        /// Reason.
        message: String,
    },
}

impl DomainEvent {
    /// Short event name used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CaseCreated { .. } => "caseCreated",
            Self::CaseTransitioned { .. } => "caseTransitioned",
            Self::CaseCancelled { .. } => "caseCancelled",
            Self::CaseDeleted { .. } => "caseDeleted",
            Self::ArtifactAttached { .. } => "artifactAttached",
            Self::ArtifactReplaced { .. } => "artifactReplaced",
            Self::ArtifactDeleted { .. } => "artifactDeleted",
            Self::CreditAllocated { .. } => "creditAllocated",
            Self::CreditReclaimed { .. } => "creditReclaimed",
            Self::CreditRefunded { .. } => "creditRefunded",
            Self::CreditInsufficient { .. } => "creditInsufficient",
            Self::CreditShortage { .. } => "creditShortage",
            Self::LowStorage { .. } => "lowStorage",
            Self::UploadJobCreated { .. } => "uploadJobCreated",
            Self::UploadJobMaterialized { .. } => "uploadJobMaterialized",
            Self::UploadJobRejected { .. } => "uploadJobRejected",
        }
    }
}

/// A subscriber to domain events (email, in-app notification, audit sink).
pub trait DomainEventListener: Send + Sync {
    /// Unique listener name. Registering a second listener with the same
    /// name replaces the first.
    fn name(&self) -> &str;

    /// Handle one event.
    fn on_event(&self, event: &DomainEvent);
}

/// Registry of listeners that every component publishes through.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn DomainEventListener>>>,
}

impl EventBus {
    /// Create a bus with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener, replacing any listener with the same name.
    pub fn register(&self, listener: Arc<dyn DomainEventListener>) {
        let mut listeners = self.listeners.write();
        let name = listener.name().to_string();
        listeners.retain(|l| l.name() != name);
        debug!(name = %name, "registering event listener");
        listeners.push(listener);
    }

    /// Unregister a listener by name. Returns `true` if one was removed.
    pub fn unregister(&self, name: &str) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| l.name() != name);
        listeners.len() < before
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Deliver events to every listener, in registration order.
    pub fn publish(&self, events: &[DomainEvent]) {
        if events.is_empty() {
            return;
        }
        // Snapshot so a listener may register/unregister without deadlocking.
        let listeners = self.listeners.read().clone();
        for event in events {
            debug!(event = event.name(), listeners = listeners.len(), "publishing");
            for listener in &listeners {
                listener.on_event(event);
            }
        }
    }
}

/// Listener that keeps every event it receives. Useful in tests and for
/// operator tooling that wants to print what an operation emitted.
#[derive(Default)]
pub struct CollectingListener {
    name: String,
    events: Mutex<Vec<DomainEvent>>,
}

impl CollectingListener {
    /// Create a collector with the given listener name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of received events.
    #[must_use]
    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().clone()
    }

    /// Names of received events, in order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(DomainEvent::name).collect()
    }

    /// Drop everything received so far.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl DomainEventListener for CollectingListener {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_event(&self, event: &DomainEvent) {
        self.events.lock().push(event.clone());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn low_storage() -> DomainEvent {
        DomainEvent::LowStorage {
            free: 1,
            threshold: 10,
        }
    }

    #[test]
    fn publish_reaches_all_listeners() {
        let bus = EventBus::new();
        let a = Arc::new(CollectingListener::new("a"));
        let b = Arc::new(CollectingListener::new("b"));
        bus.register(a.clone());
        bus.register(b.clone());

        bus.publish(&[low_storage()]);

        assert_eq!(a.events(), vec![low_storage()]);
        assert_eq!(b.events(), vec![low_storage()]);
    }

    #[test]
    fn register_same_name_replaces() {
        let bus = EventBus::new();
        let first = Arc::new(CollectingListener::new("mail"));
        let second = Arc::new(CollectingListener::new("mail"));
        bus.register(first.clone());
        bus.register(second.clone());
        assert_eq!(bus.count(), 1);

        bus.publish(&[low_storage()]);
        assert!(first.events().is_empty());
        assert_eq!(second.events().len(), 1);
    }

    #[test]
    fn unregister_removes_listener() {
        let bus = EventBus::new();
        let l = Arc::new(CollectingListener::new("x"));
        bus.register(l.clone());
        assert!(bus.unregister("x"));
        assert!(!bus.unregister("x"));

        bus.publish(&[low_storage()]);
        assert!(l.events().is_empty());
    }

    #[test]
    fn publish_empty_is_noop() {
        let bus = EventBus::new();
        let l = Arc::new(CollectingListener::new("x"));
        bus.register(l.clone());
        bus.publish(&[]);
        assert!(l.events().is_empty());
    }

    #[test]
    fn serializes_with_type_tag() {
        let event = DomainEvent::CaseCancelled {
            case_id: CaseId::from("case_1"),
            refund_entry_id: EntryId::from("led_1"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "caseCancelled");
        assert_eq!(json["caseId"], "case_1");
        assert_eq!(json["refundEntryId"], "led_1");
    }

    #[test]
    fn names_match_serde_tags() {
        let event = low_storage();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.name());
    }

    #[test]
    fn collector_clear() {
        let l = CollectingListener::new("x");
        l.on_event(&low_storage());
        assert_eq!(l.names(), vec!["lowStorage"]);
        l.clear();
        assert!(l.events().is_empty());
    }
}
