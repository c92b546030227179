//! The registry's per-attempt progress row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::process_result::{Stage, Status};

/// What kind of work an attempt row tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Ingest,
    Fixity,
    Restore,
    Delete,
    Replication,
}

/// One row in the registry's work log, keyed by `(etag, name, bag_date)`.
///
/// Workers update the row as the envelope moves through stages; operators
/// read it to answer "where is my bag".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ProcessStatus {
    #[serde(default)]
    pub id: Option<u64>,
    pub name: String,
    pub etag: String,
    pub bag_date: DateTime<Utc>,
    pub institution: String,
    pub action: Action,
    pub stage: Stage,
    pub status: Status,
    #[serde(default)]
    pub outcome: String,
    pub retry: bool,
    #[serde(default)]
    pub reviewed: bool,
    #[serde(default)]
    pub note: String,
    /// Set for restore/delete rows, which act on registered objects and
    /// files instead of receiving-bucket uploads.
    #[serde(default)]
    pub object_identifier: String,
    #[serde(default)]
    pub generic_file_identifier: String,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
}

impl ProcessStatus {
    /// The registry's natural key for this attempt.
    pub fn key(&self) -> (String, String, DateTime<Utc>) {
        (self.etag.clone(), self.name.clone(), self.bag_date)
    }

    /// Stamp a stage/status transition plus a note.
    pub fn transition(&mut self, stage: Stage, status: Status, note: &str) {
        self.stage = stage;
        self.status = status;
        self.note = note.to_string();
        self.date = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_stamps_date() {
        let mut ps = ProcessStatus {
            id: None,
            name: "bag.tar".into(),
            etag: "e".into(),
            bag_date: Utc::now(),
            institution: "test.edu".into(),
            action: Action::Ingest,
            stage: Stage::Receive,
            status: Status::Pending,
            outcome: String::new(),
            retry: true,
            reviewed: false,
            note: String::new(),
            object_identifier: String::new(),
            generic_file_identifier: String::new(),
            date: None,
        };
        ps.transition(Stage::Record, Status::Success, "metadata recorded");
        assert_eq!(ps.stage, Stage::Record);
        assert_eq!(ps.status, Status::Success);
        assert!(ps.date.is_some());
    }
}
