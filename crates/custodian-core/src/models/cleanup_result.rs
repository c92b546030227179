//! Receiving-bucket deletion requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One object-store key to remove.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CleanupFile {
    pub bucket: String,
    pub key: String,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: String,
}

impl CleanupFile {
    pub fn new(bucket: &str, key: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
            deleted_at: None,
            error_message: String::new(),
        }
    }
}

/// Envelope for the cleanup and delete topics: remove these keys, then
/// resolve the matching registry row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CleanupResult {
    pub bag_name: String,
    pub etag: String,
    pub bag_date: DateTime<Utc>,
    pub institution: String,
    pub files: Vec<CleanupFile>,
}

impl CleanupResult {
    pub fn succeeded(&self) -> bool {
        self.files.iter().all(|f| f.deleted_at.is_some())
    }

    pub fn errors(&self) -> Vec<&str> {
        self.files
            .iter()
            .filter(|f| !f.error_message.is_empty())
            .map(|f| f.error_message.as_str())
            .collect()
    }
}
