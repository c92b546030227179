//! Bag parsing, validation, and assembly.
//!
//! A bag is a tarred directory with a `data/` payload, manifest files
//! listing payload paths and digests, and tag files with human-readable
//! metadata. [`read_bag`] turns an unpacked directory into a
//! [`BagReadResult`]; [`BagWriter`] builds one for restoration; the
//! `tarball` helpers pack and unpack the archives.

mod reader;
mod tarball;
mod writer;

pub use reader::{mime_for, read_bag};
pub use tarball::{pack, unpack};
pub use writer::BagWriter;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::Error;

/// One `Label: value` line from a tag file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub label: String,
    pub value: String,
}

/// One file under `data/`, with digests computed during the read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PayloadFile {
    /// Bag-relative path, always starting with `data/`.
    pub path: String,
    pub size: u64,
    pub md5: String,
    pub sha256: String,
}

/// Structured result of reading one unpacked bag directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BagReadResult {
    pub path: PathBuf,
    pub tags: Vec<Tag>,
    pub payload: Vec<PayloadFile>,
    /// Structural and fixity problems found during the read. Empty means
    /// the bag conforms to the profile.
    pub errors: Vec<String>,
}

impl BagReadResult {
    /// First value for a tag label, searching all tag files in order.
    pub fn tag_value(&self, label: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.label.eq_ignore_ascii_case(label))
            .map(|t| t.value.as_str())
    }

    pub fn total_payload_size(&self) -> u64 {
        self.payload.iter().map(|f| f.size).sum()
    }

    /// Error out on any recorded defect.
    pub fn require_valid(&self) -> Result<(), Error> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(Error::BagInvalid(self.errors.join("; ")))
        }
    }
}
