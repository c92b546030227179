//! Outcome ledger for registry calls made while recording a bag.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Object,
    File,
    Event,
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryAction {
    Create,
    Update,
}

/// One registry call's outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RegistryCall {
    pub entity_type: EntityType,
    pub action: RegistryAction,
    /// Identifier of the record the call was about.
    pub subject: String,
    #[serde(default)]
    pub error: Option<String>,
}

/// Append-only record of every registry call the recorder made for one
/// envelope. Survives serialization so the trouble sink shows exactly
/// which calls succeeded and which did not.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FedoraResult {
    pub calls: Vec<RegistryCall>,
}

impl FedoraResult {
    pub fn record_success(&mut self, entity_type: EntityType, action: RegistryAction, subject: &str) {
        self.calls.push(RegistryCall {
            entity_type,
            action,
            subject: subject.to_string(),
            error: None,
        });
    }

    pub fn record_failure(
        &mut self,
        entity_type: EntityType,
        action: RegistryAction,
        subject: &str,
        error: &str,
    ) {
        self.calls.push(RegistryCall {
            entity_type,
            action,
            subject: subject.to_string(),
            error: Some(error.to_string()),
        });
    }

    pub fn all_succeeded(&self) -> bool {
        self.calls.iter().all(|c| c.error.is_none())
    }

    /// Counts as (ok, failed).
    pub fn tally(&self) -> (usize, usize) {
        let failed = self.calls.iter().filter(|c| c.error.is_some()).count();
        (self.calls.len() - failed, failed)
    }

    /// One sentence per failed call, for `error_message` accumulation.
    pub fn error_summary(&self) -> String {
        self.calls
            .iter()
            .filter_map(|c| {
                c.error
                    .as_ref()
                    .map(|e| format!("{:?} {:?} {} failed: {e}.", c.action, c.entity_type, c.subject))
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}
