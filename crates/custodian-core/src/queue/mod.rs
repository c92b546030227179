//! Queue broker seam.
//!
//! The broker itself is an external service providing topics, channels,
//! re-delivery, and per-message heartbeats. Workers only see this trait:
//! a stream of [`Delivery`] values per subscription, and `publish` for
//! handing envelopes to the next topic. [`memory::MemoryBroker`] backs the
//! tests and local development; [`http::HttpBroker`] talks to a deployed
//! broker over its HTTP endpoints.

pub mod http;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Back-channel to the broker for one delivered message.
#[async_trait]
pub trait MessageHandle: Send + Sync {
    /// Reset the broker's redelivery timer.
    async fn touch(&self);
    /// Acknowledge the message; the broker forgets it.
    async fn finish(&self);
    /// Hand the message back for redelivery after `delay`.
    async fn requeue(&self, delay: Duration);
}

/// One message delivery.
///
/// `attempts` counts deliveries of this message including the current
/// one; workers compare it against their configured maximum before
/// requeueing.
#[derive(Clone)]
pub struct Delivery {
    pub id: String,
    pub attempts: u32,
    pub body: Bytes,
    handle: Arc<dyn MessageHandle>,
}

impl Delivery {
    pub fn new(id: String, attempts: u32, body: Bytes, handle: Arc<dyn MessageHandle>) -> Self {
        Self {
            id,
            attempts,
            body,
            handle,
        }
    }

    /// Deserialize the JSON envelope.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub async fn touch(&self) {
        self.handle.touch().await;
    }

    pub async fn finish(&self) {
        self.handle.finish().await;
    }

    pub async fn requeue(&self, delay: Duration) {
        self.handle.requeue(delay).await;
    }

    /// Clone of the underlying handle, for heartbeat tasks that must
    /// outlive a borrow of the delivery.
    pub fn handle(&self) -> Arc<dyn MessageHandle> {
        self.handle.clone()
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("id", &self.id)
            .field("attempts", &self.attempts)
            .field("bytes", &self.body.len())
            .finish()
    }
}

/// The pub/sub transport.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Join `channel` on `topic`. Deliveries arrive on the returned
    /// receiver; its bounded capacity is the worker's ingress backpressure.
    async fn subscribe(
        &self,
        topic: &str,
        channel: &str,
        capacity: usize,
    ) -> anyhow::Result<mpsc::Receiver<Delivery>>;

    /// Publish one envelope to a topic.
    async fn publish(&self, topic: &str, body: Vec<u8>) -> anyhow::Result<()>;
}

/// Publish a serde value as a JSON envelope.
pub async fn publish_json<T: serde::Serialize>(
    broker: &dyn Broker,
    topic: &str,
    value: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(value)?;
    broker.publish(topic, body).await
}
