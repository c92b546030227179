//! Per-file storage records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::premis_event::PremisEvent;

/// One payload file inside a bag, stored as an individual object in the
/// preservation bucket.
///
/// The `uuid` is the storage key. It is assigned exactly once, before the
/// first upload attempt, and never changes across retries or re-ingests of
/// the same file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GenericFile {
    /// `institution/bag_name/relative_path`
    pub identifier: String,
    /// Path relative to the bag root, e.g. `data/photos/001.tif`.
    pub path: String,
    pub size: u64,
    pub md5: String,
    pub sha256: String,
    pub mime_type: String,
    pub uuid: Uuid,
    /// Empty until the object store has accepted the file.
    #[serde(default)]
    pub storage_url: String,
    #[serde(default)]
    pub stored_at: Option<DateTime<Utc>>,
    /// Digest the object store confirmed on upload. Equal to `md5`
    /// whenever `storage_url` is set.
    #[serde(default)]
    pub storage_md5: String,
    #[serde(default)]
    pub md5_verified: bool,
    /// Whether the registry diff decided this file must be uploaded.
    #[serde(default = "default_true")]
    pub needs_save: bool,
    #[serde(default)]
    pub replicated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub events: Vec<PremisEvent>,
}

fn default_true() -> bool {
    true
}

impl GenericFile {
    pub fn new(identifier: &str, path: &str, size: u64, md5: &str, sha256: &str, mime_type: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            path: path.to_string(),
            size,
            md5: md5.to_string(),
            sha256: sha256.to_string(),
            mime_type: mime_type.to_string(),
            uuid: Uuid::new_v4(),
            storage_url: String::new(),
            stored_at: None,
            storage_md5: String::new(),
            md5_verified: false,
            needs_save: true,
            replicated_at: None,
            deleted_at: None,
            events: Vec::new(),
        }
    }

    /// Record a successful upload.
    pub fn mark_stored(&mut self, storage_url: &str) {
        self.storage_url = storage_url.to_string();
        self.stored_at = Some(Utc::now());
        self.storage_md5 = self.md5.clone();
        self.needs_save = false;
    }

    pub fn is_stored(&self) -> bool {
        !self.storage_url.is_empty()
    }

    pub fn add_event(&mut self, event: PremisEvent) {
        self.events.push(event);
    }

    /// Key under the preservation (and replication) bucket.
    pub fn storage_key(&self) -> String {
        self.uuid.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_stored_pins_digest() {
        let mut gf = GenericFile::new(
            "test.edu/bag/data/a.txt",
            "data/a.txt",
            12,
            "md5md5",
            "sha256sha256",
            "text/plain",
        );
        assert!(!gf.is_stored());
        assert!(gf.needs_save);

        gf.mark_stored("https://store.example/preservation/abc");
        assert!(gf.is_stored());
        assert_eq!(gf.storage_md5, gf.md5);
        assert!(!gf.needs_save);
        assert!(gf.stored_at.is_some());
    }

    #[test]
    fn test_uuid_survives_serde_round_trip() {
        let gf = GenericFile::new("id", "data/a", 1, "m", "s", "text/plain");
        let json = serde_json::to_string(&gf).unwrap();
        let back: GenericFile = serde_json::from_str(&json).unwrap();
        assert_eq!(back.uuid, gf.uuid);
    }
}
