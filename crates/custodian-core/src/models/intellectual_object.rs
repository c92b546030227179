//! The logical aggregate a bag represents.

use serde::{Deserialize, Serialize};

use super::generic_file::GenericFile;
use super::premis_event::PremisEvent;

/// The registry's view of one bag: identity, descriptive metadata, and the
/// set of files it owns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct IntellectualObject {
    /// `institution/bag_name`
    pub identifier: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub institution: String,
    pub bag_name: String,
    /// Access policy from the bag's tag files (consortia, institution,
    /// restricted). Stored verbatim.
    #[serde(default)]
    pub access: String,
    #[serde(default)]
    pub alt_identifier: Vec<String>,
    #[serde(default)]
    pub files: Vec<GenericFile>,
    #[serde(default)]
    pub events: Vec<PremisEvent>,
}

impl IntellectualObject {
    pub fn total_file_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Look up a file by its full identifier.
    pub fn find_file(&self, identifier: &str) -> Option<&GenericFile> {
        self.files.iter().find(|f| f.identifier == identifier)
    }
}
