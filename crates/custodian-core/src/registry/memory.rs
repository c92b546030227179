//! In-memory registry fake for tests.
//!
//! Keeps the same create/update/dedup semantics the REST service
//! advertises, including event dedup by identifier, so recorder retries
//! can be tested without a network.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{EventSubject, Registry};
use crate::models::{GenericFile, IntellectualObject, PremisEvent, ProcessStatus, Status};

#[derive(Default)]
struct State {
    objects: HashMap<String, IntellectualObject>,
    statuses: Vec<ProcessStatus>,
    next_status_id: u64,
    /// Object identifier → events attached directly to the object.
    object_events: HashMap<String, Vec<PremisEvent>>,
    /// Call counter per method name, for assertions.
    calls: HashMap<&'static str, usize>,
    /// Method names that should fail until cleared.
    failing: Vec<&'static str>,
}

#[derive(Default)]
pub struct MemoryRegistry {
    state: Mutex<State>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the named method return an error until `heal` is called.
    pub fn break_method(&self, method: &'static str) {
        self.state.lock().unwrap().failing.push(method);
    }

    pub fn heal(&self) {
        self.state.lock().unwrap().failing.clear();
    }

    pub fn call_count(&self, method: &str) -> usize {
        *self.state.lock().unwrap().calls.get(method).unwrap_or(&0)
    }

    /// Direct inspection for tests.
    pub fn object(&self, identifier: &str) -> Option<IntellectualObject> {
        self.state.lock().unwrap().objects.get(identifier).cloned()
    }

    pub fn object_events(&self, identifier: &str) -> Vec<PremisEvent> {
        self.state
            .lock()
            .unwrap()
            .object_events
            .get(identifier)
            .cloned()
            .unwrap_or_default()
    }

    pub fn statuses(&self) -> Vec<ProcessStatus> {
        self.state.lock().unwrap().statuses.clone()
    }

    /// Seed a pre-existing object, as a prior ingest would have left it.
    pub fn seed_object(&self, object: IntellectualObject) {
        let mut state = self.state.lock().unwrap();
        state.objects.insert(object.identifier.clone(), object);
    }

    pub fn seed_status(&self, mut status: ProcessStatus) {
        let mut state = self.state.lock().unwrap();
        state.next_status_id += 1;
        status.id = Some(state.next_status_id);
        state.statuses.push(status);
    }

    fn begin(&self, method: &'static str) -> anyhow::Result<std::sync::MutexGuard<'_, State>> {
        let mut state = self.state.lock().unwrap();
        *state.calls.entry(method).or_insert(0) += 1;
        if state.failing.contains(&method) {
            anyhow::bail!("registry 500: {method} unavailable");
        }
        Ok(state)
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn get_status(
        &self,
        etag: &str,
        name: &str,
        bag_date: DateTime<Utc>,
    ) -> anyhow::Result<Option<ProcessStatus>> {
        let state = self.begin("get_status")?;
        Ok(state
            .statuses
            .iter()
            .find(|s| s.etag == etag && s.name == name && s.bag_date == bag_date)
            .cloned())
    }

    async fn save_status(&self, status: &ProcessStatus) -> anyhow::Result<ProcessStatus> {
        let mut state = self.begin("save_status")?;
        let mut saved = status.clone();
        match status.id {
            Some(id) => {
                if let Some(existing) = state.statuses.iter_mut().find(|s| s.id == Some(id)) {
                    *existing = saved.clone();
                }
            }
            None => {
                state.next_status_id += 1;
                saved.id = Some(state.next_status_id);
                state.statuses.push(saved.clone());
            }
        }
        Ok(saved)
    }

    async fn statuses_for_object(
        &self,
        object_identifier: &str,
    ) -> anyhow::Result<Vec<ProcessStatus>> {
        let state = self.begin("statuses_for_object")?;
        Ok(state
            .statuses
            .iter()
            .filter(|s| s.object_identifier == object_identifier)
            .cloned()
            .collect())
    }

    async fn get_object(
        &self,
        identifier: &str,
        include_relations: bool,
    ) -> anyhow::Result<Option<IntellectualObject>> {
        let state = self.begin("get_object")?;
        Ok(state.objects.get(identifier).map(|o| {
            let mut object = o.clone();
            if !include_relations {
                object.files.clear();
                object.events.clear();
            }
            object
        }))
    }

    async fn create_object(&self, object: &IntellectualObject) -> anyhow::Result<IntellectualObject> {
        let mut state = self.begin("create_object")?;
        if state.objects.contains_key(&object.identifier) {
            anyhow::bail!("object {} already exists", object.identifier);
        }
        state.objects.insert(object.identifier.clone(), object.clone());
        Ok(object.clone())
    }

    async fn update_object(&self, object: &IntellectualObject) -> anyhow::Result<IntellectualObject> {
        let mut state = self.begin("update_object")?;
        let existing = state
            .objects
            .get_mut(&object.identifier)
            .ok_or_else(|| anyhow::anyhow!("object {} not found", object.identifier))?;
        // Keep files recorded by earlier save_file calls.
        let files = std::mem::take(&mut existing.files);
        *existing = object.clone();
        if existing.files.is_empty() {
            existing.files = files;
        }
        Ok(object.clone())
    }

    async fn save_file(
        &self,
        object_identifier: &str,
        file: &GenericFile,
    ) -> anyhow::Result<GenericFile> {
        let mut state = self.begin("save_file")?;
        let object = state
            .objects
            .get_mut(object_identifier)
            .ok_or_else(|| anyhow::anyhow!("object {object_identifier} not found"))?;
        match object.files.iter_mut().find(|f| f.identifier == file.identifier) {
            Some(existing) => *existing = file.clone(),
            None => object.files.push(file.clone()),
        }
        Ok(file.clone())
    }

    async fn save_event(
        &self,
        subject: EventSubject<'_>,
        event: &PremisEvent,
    ) -> anyhow::Result<PremisEvent> {
        let mut state = self.begin("save_event")?;
        match subject {
            EventSubject::Object(id) => {
                let events = state.object_events.entry(id.to_string()).or_default();
                if !events.iter().any(|e| e.identifier == event.identifier) {
                    events.push(event.clone());
                }
            }
            EventSubject::File(id) => {
                let file = state
                    .objects
                    .values_mut()
                    .flat_map(|o| o.files.iter_mut())
                    .find(|f| f.identifier == id)
                    .ok_or_else(|| anyhow::anyhow!("file {id} not found"))?;
                if !file.events.iter().any(|e| e.identifier == event.identifier) {
                    file.events.push(event.clone());
                }
            }
        }
        Ok(event.clone())
    }

    async fn reviewed_statuses(&self) -> anyhow::Result<Vec<ProcessStatus>> {
        let state = self.begin("reviewed_statuses")?;
        Ok(state.statuses.iter().filter(|s| s.reviewed).cloned().collect())
    }

    async fn ingested_since(&self, when: DateTime<Utc>) -> anyhow::Result<Vec<ProcessStatus>> {
        let state = self.begin("ingested_since")?;
        Ok(state
            .statuses
            .iter()
            .filter(|s| s.status == Status::Success && s.date.map(|d| d >= when).unwrap_or(false))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Action, Stage};

    #[tokio::test]
    async fn test_event_dedup_by_identifier() {
        let registry = MemoryRegistry::new();
        registry.seed_object(IntellectualObject {
            identifier: "test.edu/bag".into(),
            ..Default::default()
        });

        let event = PremisEvent::ingest("url", "md5");
        registry
            .save_event(EventSubject::Object("test.edu/bag"), &event)
            .await
            .unwrap();
        registry
            .save_event(EventSubject::Object("test.edu/bag"), &event)
            .await
            .unwrap();
        assert_eq!(registry.object_events("test.edu/bag").len(), 1);
    }

    #[tokio::test]
    async fn test_break_method_simulates_outage() {
        let registry = MemoryRegistry::new();
        registry.break_method("create_object");
        let object = IntellectualObject {
            identifier: "x".into(),
            ..Default::default()
        };
        assert!(registry.create_object(&object).await.is_err());
        registry.heal();
        assert!(registry.create_object(&object).await.is_ok());
    }

    #[tokio::test]
    async fn test_bulk_queries_filter_rows() {
        let registry = MemoryRegistry::new();
        let old = Utc::now() - chrono::Duration::days(120);
        for (reviewed, date) in [(true, Some(Utc::now())), (false, Some(old)), (false, None)] {
            registry.seed_status(ProcessStatus {
                id: None,
                name: "bag.tar".into(),
                etag: format!("etag-{reviewed}-{}", date.is_some()),
                bag_date: Utc::now(),
                institution: "test.edu".into(),
                action: Action::Ingest,
                stage: Stage::Cleanup,
                status: Status::Success,
                outcome: "Success".into(),
                retry: false,
                reviewed,
                note: String::new(),
                object_identifier: String::new(),
                generic_file_identifier: String::new(),
                date,
            });
        }

        assert_eq!(registry.reviewed_statuses().await.unwrap().len(), 1);
        let cutoff = Utc::now() - chrono::Duration::days(30);
        assert_eq!(registry.ingested_since(cutoff).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_status_save_assigns_id_then_updates() {
        let registry = MemoryRegistry::new();
        let mut status = ProcessStatus {
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
        let saved = registry.save_status(&status).await.unwrap();
        assert_eq!(saved.id, Some(1));

        status = saved;
        status.transition(Stage::Record, Status::Success, "done");
        registry.save_status(&status).await.unwrap();
        assert_eq!(registry.statuses().len(), 1);
        assert_eq!(registry.statuses()[0].stage, Stage::Record);
    }
}
