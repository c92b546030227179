//! REST client for the archival registry.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::StatusCode;

use super::{EventSubject, Registry};
use crate::models::{GenericFile, IntellectualObject, PremisEvent, ProcessStatus};

pub struct HttpRegistry {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpRegistry {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.url(path))
            .header("X-Custodian-API-Key", &self.token)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> anyhow::Result<Option<T>> {
        let response = self.request(reqwest::Method::GET, path).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.json().await?))
    }

    async fn send_json<B: serde::Serialize, T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &B,
    ) -> anyhow::Result<T> {
        let response = self
            .request(method, path)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

fn iso(when: DateTime<Utc>) -> String {
    when.to_rfc3339_opts(SecondsFormat::Secs, true)
}

// Identifiers contain slashes (institution/bag/path); they travel
// percent-encoded in paths.
fn encode(identifier: &str) -> String {
    identifier.replace('/', "%2F")
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn get_status(
        &self,
        etag: &str,
        name: &str,
        bag_date: DateTime<Utc>,
    ) -> anyhow::Result<Option<ProcessStatus>> {
        self.get_json(&format!("/itemresults/{etag}/{name}/{}", iso(bag_date)))
            .await
    }

    async fn save_status(&self, status: &ProcessStatus) -> anyhow::Result<ProcessStatus> {
        match status.id {
            Some(id) => {
                self.send_json(reqwest::Method::PUT, &format!("/itemresults/{id}"), status)
                    .await
            }
            None => self.send_json(reqwest::Method::POST, "/itemresults", status).await,
        }
    }

    async fn statuses_for_object(
        &self,
        object_identifier: &str,
    ) -> anyhow::Result<Vec<ProcessStatus>> {
        Ok(self
            .get_json(&format!("/itemresults/object/{}", encode(object_identifier)))
            .await?
            .unwrap_or_default())
    }

    async fn get_object(
        &self,
        identifier: &str,
        include_relations: bool,
    ) -> anyhow::Result<Option<IntellectualObject>> {
        let relations = if include_relations { "true" } else { "false" };
        self.get_json(&format!(
            "/objects/{}?include_relations={relations}",
            encode(identifier)
        ))
        .await
    }

    async fn create_object(&self, object: &IntellectualObject) -> anyhow::Result<IntellectualObject> {
        self.send_json(reqwest::Method::POST, "/objects", object).await
    }

    async fn update_object(&self, object: &IntellectualObject) -> anyhow::Result<IntellectualObject> {
        self.send_json(
            reqwest::Method::PUT,
            &format!("/objects/{}", encode(&object.identifier)),
            object,
        )
        .await
    }

    async fn save_file(
        &self,
        object_identifier: &str,
        file: &GenericFile,
    ) -> anyhow::Result<GenericFile> {
        self.send_json(
            reqwest::Method::POST,
            &format!("/objects/{}/files", encode(object_identifier)),
            file,
        )
        .await
    }

    async fn save_event(
        &self,
        subject: EventSubject<'_>,
        event: &PremisEvent,
    ) -> anyhow::Result<PremisEvent> {
        let path = match subject {
            EventSubject::Object(id) => format!("/objects/{}/events", encode(id)),
            EventSubject::File(id) => format!("/files/{}/events", encode(id)),
        };
        self.send_json(reqwest::Method::POST, &path, event).await
    }

    async fn reviewed_statuses(&self) -> anyhow::Result<Vec<ProcessStatus>> {
        Ok(self
            .get_json("/itemresults/get_reviewed")
            .await?
            .unwrap_or_default())
    }

    async fn ingested_since(&self, when: DateTime<Utc>) -> anyhow::Result<Vec<ProcessStatus>> {
        Ok(self
            .get_json(&format!("/itemresults/ingested_since/{}", iso(when)))
            .await?
            .unwrap_or_default())
    }
}
