//! Preservation event records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kinds of preservation events the pipeline emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Ingest,
    IdentifierAssignment,
    FixityGeneration,
    FixityCheck,
    Replication,
    Deletion,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Ingest => write!(f, "ingest"),
            EventType::IdentifierAssignment => write!(f, "identifier_assignment"),
            EventType::FixityGeneration => write!(f, "fixity_generation"),
            EventType::FixityCheck => write!(f, "fixity_check"),
            EventType::Replication => write!(f, "replication"),
            EventType::Deletion => write!(f, "deletion"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOutcome {
    Success,
    Failure,
}

/// One immutable preservation event.
///
/// The identifier is generated locally before the registry call and acts
/// as the registry's dedup key, so a retried recording never produces a
/// second event row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PremisEvent {
    pub identifier: Uuid,
    pub event_type: EventType,
    pub date_time: DateTime<Utc>,
    pub detail: String,
    pub outcome: EventOutcome,
    pub outcome_detail: String,
    /// What produced the outcome (digest algorithm, client name).
    pub object: String,
    pub agent: String,
}

impl PremisEvent {
    fn new(event_type: EventType, detail: &str, outcome_detail: &str, object: &str) -> Self {
        Self {
            identifier: Uuid::new_v4(),
            event_type,
            date_time: Utc::now(),
            detail: detail.to_string(),
            outcome: EventOutcome::Success,
            outcome_detail: outcome_detail.to_string(),
            object: object.to_string(),
            agent: "custodian".to_string(),
        }
    }

    /// Successful copy into the preservation bucket.
    pub fn ingest(storage_url: &str, md5: &str) -> Self {
        Self::new(
            EventType::Ingest,
            "Completed copy to preservation storage",
            md5,
            storage_url,
        )
    }

    /// Storage UUID handed to a file before upload.
    pub fn identifier_assignment(identifier: &str) -> Self {
        Self::new(
            EventType::IdentifierAssignment,
            "Assigned storage identifier",
            identifier,
            "uuid v4",
        )
    }

    /// Digest computed at validation time.
    pub fn fixity_generation(sha256: &str) -> Self {
        Self::new(
            EventType::FixityGeneration,
            "Calculated new fixity value",
            sha256,
            "sha256",
        )
    }

    /// Scheduled re-check of a stored file's digest.
    pub fn fixity_check(matched: bool, expected: &str, actual: &str) -> Self {
        let mut event = Self::new(
            EventType::FixityCheck,
            "Fixity check against registered digest",
            actual,
            "sha256",
        );
        if !matched {
            event.outcome = EventOutcome::Failure;
            event.outcome_detail = format!("expected {expected}, got {actual}");
        }
        event
    }

    /// Copy into the replication bucket.
    pub fn replication(replication_url: &str) -> Self {
        Self::new(
            EventType::Replication,
            "Copied to replication storage",
            replication_url,
            replication_url,
        )
    }

    /// File removed from long-term storage.
    pub fn deletion(key: &str, requested_by: &str) -> Self {
        Self::new(EventType::Deletion, "File deleted at request", requested_by, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_types_render_snake_case() {
        assert_eq!(EventType::IdentifierAssignment.to_string(), "identifier_assignment");
        assert_eq!(EventType::FixityCheck.to_string(), "fixity_check");
    }

    #[test]
    fn test_failed_fixity_check_carries_both_digests() {
        let event = PremisEvent::fixity_check(false, "aaa", "bbb");
        assert_eq!(event.outcome, EventOutcome::Failure);
        assert!(event.outcome_detail.contains("aaa"));
        assert!(event.outcome_detail.contains("bbb"));
    }

    #[test]
    fn test_events_get_distinct_identifiers() {
        let a = PremisEvent::ingest("https://example/1", "d41d8");
        let b = PremisEvent::ingest("https://example/1", "d41d8");
        assert_ne!(a.identifier, b.identifier);
    }
}
