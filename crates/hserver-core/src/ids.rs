//! Branded ID newtypes for type safety.
//!
//! Every entity in the pipeline has a distinct ID type implemented as a
//! newtype wrapper around `String`, so a study ID can never be passed where a
//! case ID is expected. Cross-entity references (study ↔ upload job ↔ case)
//! are always made through these identifiers, never through owned pointers.
//!
//! Generated IDs are `<prefix>_<UUID v7>` (time-ordered). Actor IDs are
//! supplied by the identity layer and treated as opaque.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Prefix used for freshly generated IDs.
            pub const PREFIX: &'static str = $prefix;

            /// Create a new random ID (`<prefix>_<UUID v7>`).
            #[must_use]
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            /// Create from an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Unique identifier for a credit ledger entry.
    EntryId, "led"
}

branded_id! {
    /// Unique identifier for a case (`RusCase`).
    CaseId, "case"
}

branded_id! {
    /// Unique identifier for a materialized study.
    StudyId, "study"
}

branded_id! {
    /// Unique identifier for an artifact record (raw input or result).
    ArtifactId, "art"
}

branded_id! {
    /// Unique identifier for an upload job.
    JobId, "job"
}

branded_id! {
    /// Opaque identifier of the user or service that caused an operation.
    ActorId, "actor"
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid_part(id: &str) -> Uuid {
        let (_, raw) = id.split_once('_').expect("prefixed id");
        Uuid::parse_str(raw).expect("should be valid UUID")
    }

    #[test]
    fn case_id_new_is_prefixed_uuid_v7() {
        let id = CaseId::new();
        assert!(id.as_str().starts_with("case_"));
        assert_eq!(uuid_part(&id).get_version(), Some(uuid::Version::SortRand));
    }

    #[test]
    fn each_type_uses_its_own_prefix() {
        assert!(EntryId::new().starts_with("led_"));
        assert!(StudyId::new().starts_with("study_"));
        assert!(ArtifactId::new().starts_with("art_"));
        assert!(JobId::new().starts_with("job_"));
        assert!(ActorId::new().starts_with("actor_"));
    }

    #[test]
    fn ids_are_unique_and_time_ordered() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn from_string_preserves_value() {
        let id = ActorId::from_string("user-42".to_string());
        assert_eq!(id.as_str(), "user-42");
        assert_eq!(id.to_string(), "user-42");
        assert_eq!(String::from(id), "user-42");
    }

    #[test]
    fn deref_and_as_ref() {
        let id = StudyId::from("study_x");
        let s: &str = &id;
        assert_eq!(s, "study_x");
        assert_eq!(id.as_ref(), "study_x");
        assert_eq!(id.len(), 7);
    }

    #[test]
    fn serde_is_transparent() {
        let id = CaseId::from("case_1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"case_1\"");
        let back: CaseId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
