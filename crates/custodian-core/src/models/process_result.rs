//! The root work item for the ingest pipeline.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::fedora_result::FedoraResult;
use super::generic_file::GenericFile;
use super::premis_event::PremisEvent;
use super::s3_file::S3File;
use crate::bag::BagReadResult;

/// Pipeline stages, in processing order.
///
/// The ordinal only ever moves forward within one delivery; `advance`
/// enforces that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Receive,
    Fetch,
    Unpack,
    Validate,
    Store,
    Record,
    Cleanup,
    Resolve,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Receive => write!(f, "receive"),
            Stage::Fetch => write!(f, "fetch"),
            Stage::Unpack => write!(f, "unpack"),
            Stage::Validate => write!(f, "validate"),
            Stage::Store => write!(f, "store"),
            Stage::Record => write!(f, "record"),
            Stage::Cleanup => write!(f, "cleanup"),
            Stage::Resolve => write!(f, "resolve"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Started,
    Success,
    Failed,
}

/// What the fetch stage produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FetchResult {
    pub local_path: PathBuf,
    /// MD5 reported by the object store (etag), when it is one.
    pub remote_md5: Option<String>,
    /// MD5 computed while streaming to disk.
    pub local_md5: String,
    pub bytes_fetched: u64,
}

/// What the unpack stage produced: where the bag landed and the files
/// found in its payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TarResult {
    pub output_dir: PathBuf,
    pub generic_files: Vec<GenericFile>,
}

/// One queue delivery's worth of ingest state.
///
/// Owned by exactly one stage routine at a time; the in-flight registry
/// guarantees no second copy is being worked anywhere in the process.
/// `error_message` is append-only within a delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ProcessResult {
    pub s3_file: S3File,
    pub stage: Stage,
    pub status: Status,
    pub retry: bool,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub fetch_result: Option<FetchResult>,
    #[serde(default)]
    pub tar_result: Option<TarResult>,
    #[serde(default)]
    pub bag_read_result: Option<BagReadResult>,
    #[serde(default)]
    pub fedora_result: Option<FedoraResult>,
    /// Object-level preservation events, minted once at validation.
    /// They ride the envelope so a retried recording reuses the same
    /// identifiers instead of creating duplicate registry rows.
    #[serde(default)]
    pub object_events: Vec<PremisEvent>,
}

impl ProcessResult {
    pub fn new(s3_file: S3File) -> Self {
        Self {
            s3_file,
            stage: Stage::Receive,
            status: Status::Pending,
            retry: true,
            error_message: String::new(),
            fetch_result: None,
            tar_result: None,
            bag_read_result: None,
            fedora_result: None,
            object_events: Vec::new(),
        }
    }

    /// At-most-once key for the ingest pipeline.
    pub fn artifact_key(&self) -> String {
        self.s3_file.identifier()
    }

    /// Move to a later stage and mark it started. Earlier stages are
    /// ignored so a redelivered envelope cannot roll its state back.
    pub fn advance(&mut self, stage: Stage) {
        if stage > self.stage {
            self.stage = stage;
        }
        self.status = Status::Started;
    }

    /// Record a stage failure. The sentence is appended; earlier failures
    /// are never erased within the same delivery.
    pub fn fail(&mut self, stage: Stage, message: &str, retry: bool) {
        self.advance(stage);
        self.status = Status::Failed;
        self.retry = retry;
        if !self.error_message.is_empty() {
            self.error_message.push(' ');
        }
        self.error_message.push_str(message);
    }

    pub fn succeed(&mut self) {
        self.status = Status::Success;
    }

    pub fn has_errors(&self) -> bool {
        !self.error_message.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample() -> ProcessResult {
        ProcessResult::new(S3File {
            bucket: "custodian.receive.test.edu".into(),
            key: "bag.tar".into(),
            size: 100,
            last_modified: Utc::now(),
            etag: "e".into(),
        })
    }

    #[test]
    fn test_stage_ordering_is_monotone() {
        let mut pr = sample();
        pr.advance(Stage::Fetch);
        pr.advance(Stage::Validate);
        pr.advance(Stage::Fetch);
        assert_eq!(pr.stage, Stage::Validate);
    }

    #[test]
    fn test_error_messages_accumulate() {
        let mut pr = sample();
        pr.fail(Stage::Store, "file 3 of 5 failed.", true);
        pr.fail(Stage::Store, "file 4 of 5 failed.", true);
        assert_eq!(pr.error_message, "file 3 of 5 failed. file 4 of 5 failed.");
        assert!(pr.retry);
    }

    #[test]
    fn test_failure_does_not_regress_stage() {
        let mut pr = sample();
        pr.advance(Stage::Store);
        pr.fail(Stage::Fetch, "late fetch error", false);
        assert_eq!(pr.stage, Stage::Store);
        assert_eq!(pr.status, Status::Failed);
    }
}
