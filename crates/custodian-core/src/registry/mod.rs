//! Archival metadata registry seam.
//!
//! The registry owns intellectual-object, file, event, and work-log
//! records; workers reach it through this trait. [`HttpRegistry`] is the
//! deployed REST client, [`MemoryRegistry`] the test fake.

mod http;
mod memory;

pub use http::HttpRegistry;
pub use memory::MemoryRegistry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{GenericFile, IntellectualObject, PremisEvent, ProcessStatus};

/// What a preservation event attaches to.
#[derive(Debug, Clone, Copy)]
pub enum EventSubject<'a> {
    Object(&'a str),
    File(&'a str),
}

impl EventSubject<'_> {
    pub fn identifier(&self) -> &str {
        match self {
            EventSubject::Object(id) | EventSubject::File(id) => id,
        }
    }
}

/// The bounded REST surface the pipeline uses.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Work-log row by its natural key, or None on 404.
    async fn get_status(
        &self,
        etag: &str,
        name: &str,
        bag_date: DateTime<Utc>,
    ) -> anyhow::Result<Option<ProcessStatus>>;

    /// Create-or-update a work-log row.
    async fn save_status(&self, status: &ProcessStatus) -> anyhow::Result<ProcessStatus>;

    /// All work-log rows for one object identifier (restore resolution).
    async fn statuses_for_object(&self, object_identifier: &str)
        -> anyhow::Result<Vec<ProcessStatus>>;

    /// An object, optionally with its files and events attached.
    async fn get_object(
        &self,
        identifier: &str,
        include_relations: bool,
    ) -> anyhow::Result<Option<IntellectualObject>>;

    async fn create_object(&self, object: &IntellectualObject) -> anyhow::Result<IntellectualObject>;

    async fn update_object(&self, object: &IntellectualObject) -> anyhow::Result<IntellectualObject>;

    /// Create-or-update one file record under an object.
    async fn save_file(
        &self,
        object_identifier: &str,
        file: &GenericFile,
    ) -> anyhow::Result<GenericFile>;

    /// Record one event. The event's locally generated identifier is the
    /// dedup key; posting the same event twice must not duplicate it.
    async fn save_event(
        &self,
        subject: EventSubject<'_>,
        event: &PremisEvent,
    ) -> anyhow::Result<PremisEvent>;

    /// Rows an operator has marked reviewed (cleanup feeder input).
    async fn reviewed_statuses(&self) -> anyhow::Result<Vec<ProcessStatus>>;

    /// Rows for bags ingested since `when` (fixity feeder input).
    async fn ingested_since(&self, when: DateTime<Utc>) -> anyhow::Result<Vec<ProcessStatus>>;
}
