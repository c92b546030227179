//! Cross-node replication records.
//!
//! These mirror the peer network's registry, not our local one. A
//! [`DpnResult`] is the work item the cross-node pipeline passes between
//! its topics; it carries the transfer request, the bag record once
//! fetched, and the local staging paths the copier produced.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a replication transfer, from the remote node's view.
///
/// Requested → Received → Stored → Confirmed on success; Cancelled is the
/// single terminal failure state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Requested,
    Received,
    Stored,
    Confirmed,
    Cancelled,
}

impl TransferStatus {
    /// Legal forward transitions only.
    pub fn can_become(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        matches!(
            (self, next),
            (Requested, Received)
                | (Received, Stored)
                | (Stored, Confirmed)
                | (Requested, Cancelled)
                | (Received, Cancelled)
                | (Stored, Cancelled)
        )
    }
}

/// A bag registered in the peer network.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DpnBag {
    pub uuid: Uuid,
    /// The originating institution's own identifier for the bag.
    pub local_id: String,
    /// Node that owns the authoritative copy.
    pub admin_node: String,
    pub size: u64,
    /// Digest algorithm name → hex value.
    pub fixities: HashMap<String, String>,
    pub member: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A request that we pull a bag from a peer node and store it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DpnReplicationTransfer {
    pub replication_id: Uuid,
    pub from_node: String,
    pub to_node: String,
    pub bag: Uuid,
    pub status: TransferStatus,
    /// Source URL the copier pulls the tar from.
    pub link: String,
    /// SHA-256 the tar must hash to.
    pub fixity_value: String,
    /// When set, the validator posts HMAC(fixity_value, nonce) back to the
    /// requesting node as proof of receipt.
    #[serde(default)]
    pub fixity_nonce: Option<String>,
    #[serde(default)]
    pub fixity_accept: Option<String>,
    pub protocol: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Which cross-node pipeline leg last touched the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DpnStage {
    Copy,
    Validate,
    Package,
    Store,
    Record,
}

/// Work item for the cross-node topics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DpnResult {
    pub transfer: DpnReplicationTransfer,
    #[serde(default)]
    pub bag: Option<DpnBag>,
    pub stage: DpnStage,
    /// Where the copier put the tar on the staging volume.
    #[serde(default)]
    pub staging_path: Option<PathBuf>,
    /// SHA-256 the validator computed over the staged tar.
    #[serde(default)]
    pub validation_digest: String,
    /// Key the storer wrote under the cross-node preservation prefix.
    #[serde(default)]
    pub storage_url: String,
    #[serde(default)]
    pub error_message: String,
    pub retry: bool,
}

impl DpnResult {
    pub fn new(transfer: DpnReplicationTransfer) -> Self {
        Self {
            transfer,
            bag: None,
            stage: DpnStage::Copy,
            staging_path: None,
            validation_digest: String::new(),
            storage_url: String::new(),
            error_message: String::new(),
            retry: true,
        }
    }

    /// At-most-once key for the replication pipeline.
    pub fn artifact_key(&self) -> String {
        self.transfer.bag.to_string()
    }

    pub fn fail(&mut self, message: &str, retry: bool) {
        self.retry = retry;
        if !self.error_message.is_empty() {
            self.error_message.push(' ');
        }
        self.error_message.push_str(message);
    }

    pub fn has_errors(&self) -> bool {
        !self.error_message.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_state_machine() {
        use TransferStatus::*;
        assert!(Requested.can_become(Received));
        assert!(Received.can_become(Stored));
        assert!(Stored.can_become(Confirmed));
        assert!(Received.can_become(Cancelled));
        assert!(!Confirmed.can_become(Cancelled));
        assert!(!Stored.can_become(Received));
        assert!(!Requested.can_become(Stored));
    }
}
