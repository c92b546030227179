//! HTTP broker client.
//!
//! Talks to the deployed broker's HTTP endpoints: `POST /pub`, long-poll
//! `GET /sub`, and `POST /touch|/fin|/req` per message. One background
//! task per subscription long-polls and feeds the worker's bounded
//! channel; a poll error backs off instead of killing the subscription.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::mpsc;

use super::{Broker, Delivery, MessageHandle};

const POLL_BACKOFF: Duration = Duration::from_secs(2);

struct Inner {
    client: reqwest::Client,
    base_url: String,
}

/// Client for an HTTP-fronted queue broker.
pub struct HttpBroker {
    inner: Arc<Inner>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    id: String,
    attempts: u32,
    body: String,
}

impl HttpBroker {
    pub fn new(base_url: &str) -> Self {
        Self {
            inner: Arc::new(Inner {
                client: reqwest::Client::new(),
                base_url: base_url.trim_end_matches('/').to_string(),
            }),
        }
    }
}

impl Inner {
    async fn poll_once(&self, topic: &str, channel: &str) -> Result<Option<WireMessage>> {
        let response = self
            .client
            .get(format!("{}/sub", self.base_url))
            .query(&[("topic", topic), ("channel", channel)])
            .send()
            .await
            .context("broker poll failed")?;

        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let message = response
            .error_for_status()
            .context("broker poll rejected")?
            .json::<WireMessage>()
            .await
            .context("broker sent an unreadable message")?;
        Ok(Some(message))
    }
}

struct HttpHandle {
    inner: Arc<Inner>,
    id: String,
}

impl HttpHandle {
    async fn post(&self, verb: &str, extra: &[(&str, String)]) {
        let mut query = vec![("id", self.id.clone())];
        query.extend(extra.iter().map(|(k, v)| (*k, v.clone())));
        let result = self
            .inner
            .client
            .post(format!("{}/{verb}", self.inner.base_url))
            .query(&query)
            .send()
            .await;
        if let Err(e) = result {
            tracing::warn!(id = %self.id, verb, error = %e, "Broker call failed");
        }
    }
}

#[async_trait]
impl MessageHandle for HttpHandle {
    async fn touch(&self) {
        self.post("touch", &[]).await;
    }

    async fn finish(&self) {
        self.post("fin", &[]).await;
    }

    async fn requeue(&self, delay: Duration) {
        self.post("req", &[("delay_ms", delay.as_millis().to_string())])
            .await;
    }
}

#[async_trait]
impl Broker for HttpBroker {
    async fn subscribe(
        &self,
        topic: &str,
        channel: &str,
        capacity: usize,
    ) -> anyhow::Result<mpsc::Receiver<Delivery>> {
        let (tx, rx) = mpsc::channel(capacity);
        let inner = self.inner.clone();
        let topic = topic.to_string();
        let channel = channel.to_string();

        tokio::spawn(async move {
            loop {
                match inner.poll_once(&topic, &channel).await {
                    Ok(Some(message)) => {
                        let handle = Arc::new(HttpHandle {
                            inner: inner.clone(),
                            id: message.id.clone(),
                        });
                        let delivery = Delivery::new(
                            message.id,
                            message.attempts,
                            Bytes::from(message.body.into_bytes()),
                            handle,
                        );
                        if tx.send(delivery).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(topic = %topic, error = %e, "Broker poll failed");
                        tokio::time::sleep(POLL_BACKOFF).await;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn publish(&self, topic: &str, body: Vec<u8>) -> anyhow::Result<()> {
        self.inner
            .client
            .post(format!("{}/pub", self.inner.base_url))
            .query(&[("topic", topic)])
            .body(body)
            .send()
            .await
            .context("broker publish failed")?
            .error_for_status()
            .context("broker rejected publish")?;
        Ok(())
    }
}
