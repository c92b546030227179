//! In-process broker with real redelivery semantics.
//!
//! Backs the integration tests and local development. Per topic, one task
//! owns the pending queue, the in-flight table, and the requeue-delay
//! heap; handles talk to it over a command channel, so there is no shared
//! lock to contend on.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use super::{Broker, Delivery, MessageHandle};

#[derive(Debug)]
enum Command {
    Publish(Bytes),
    Subscribe(mpsc::Sender<Delivery>),
    Touch(u64),
    Finish(u64),
    Requeue(u64, Duration),
}

struct StoredMessage {
    id: u64,
    attempts: u32,
    body: Bytes,
}

struct InFlight {
    message: StoredMessage,
    deadline: Instant,
}

/// An in-process topic task plus the senders pointing at it.
struct TopicState {
    tx: mpsc::UnboundedSender<Command>,
}

/// In-memory pub/sub broker.
///
/// Redelivers any message not finished or requeued within
/// `message_timeout`, incrementing its attempt count, exactly like the
/// production broker does when a worker stops heartbeating.
pub struct MemoryBroker {
    topics: Mutex<HashMap<String, TopicState>>,
    message_timeout: Duration,
}

impl MemoryBroker {
    pub fn new(message_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            topics: Mutex::new(HashMap::new()),
            message_timeout,
        })
    }

    async fn topic_sender(&self, topic: &str) -> mpsc::UnboundedSender<Command> {
        let mut topics = self.topics.lock().await;
        if let Some(state) = topics.get(topic) {
            return state.tx.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_topic(topic.to_string(), rx, self.message_timeout));
        topics.insert(topic.to_string(), TopicState { tx: tx.clone() });
        tx
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(
        &self,
        topic: &str,
        _channel: &str,
        capacity: usize,
    ) -> anyhow::Result<mpsc::Receiver<Delivery>> {
        let (tx, rx) = mpsc::channel(capacity);
        self.topic_sender(topic).await.send(Command::Subscribe(tx))?;
        Ok(rx)
    }

    async fn publish(&self, topic: &str, body: Vec<u8>) -> anyhow::Result<()> {
        self.topic_sender(topic)
            .await
            .send(Command::Publish(Bytes::from(body)))?;
        Ok(())
    }
}

struct MemoryHandle {
    tx: mpsc::UnboundedSender<Command>,
    id: u64,
}

#[async_trait]
impl MessageHandle for MemoryHandle {
    async fn touch(&self) {
        let _ = self.tx.send(Command::Touch(self.id));
    }

    async fn finish(&self) {
        let _ = self.tx.send(Command::Finish(self.id));
    }

    async fn requeue(&self, delay: Duration) {
        let _ = self.tx.send(Command::Requeue(self.id, delay));
    }
}

async fn run_topic(topic: String, mut rx: mpsc::UnboundedReceiver<Command>, timeout: Duration) {
    let mut next_id: u64 = 0;
    let mut pending: VecDeque<StoredMessage> = VecDeque::new();
    let mut in_flight: HashMap<u64, InFlight> = HashMap::new();
    // (wake_at, message) pairs waiting out a requeue delay.
    let mut delayed: Vec<(Instant, StoredMessage)> = Vec::new();
    let mut subscribers: Vec<mpsc::Sender<Delivery>> = Vec::new();
    let mut rr = 0usize;

    // Senders cloned into handles must point back at this task.
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();

    loop {
        // Move expired in-flight messages back to pending.
        let now = Instant::now();
        let expired: Vec<u64> = in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(flight) = in_flight.remove(&id) {
                tracing::debug!(topic = %topic, id, "Message timed out, redelivering");
                pending.push_back(flight.message);
            }
        }
        // Release requeue delays that have elapsed.
        let mut still_waiting = Vec::new();
        for (wake, message) in delayed.drain(..) {
            if wake <= now {
                pending.push_back(message);
            } else {
                still_waiting.push((wake, message));
            }
        }
        delayed = still_waiting;

        // Dispatch whatever fits into subscriber channels.
        subscribers.retain(|s| !s.is_closed());
        if !subscribers.is_empty() {
            while let Some(mut message) = pending.pop_front() {
                rr = (rr + 1) % subscribers.len();
                let delivery = Delivery::new(
                    format!("{}-{}", topic, message.id),
                    message.attempts + 1,
                    message.body.clone(),
                    Arc::new(MemoryHandle {
                        tx: cmd_tx.clone(),
                        id: message.id,
                    }),
                );
                match subscribers[rr].try_send(delivery) {
                    Ok(()) => {
                        message.attempts += 1;
                        in_flight.insert(
                            message.id,
                            InFlight {
                                message,
                                deadline: Instant::now() + timeout,
                            },
                        );
                    }
                    Err(_) => {
                        pending.push_front(message);
                        break;
                    }
                }
            }
        }

        // Wait for the next command from either the broker or a handle,
        // waking periodically to check deadlines.
        let command = tokio::select! {
            cmd = rx.recv() => cmd,
            cmd = cmd_rx.recv() => cmd,
            _ = tokio::time::sleep(Duration::from_millis(10)) => continue,
        };

        let Some(command) = command else {
            return;
        };

        match command {
            Command::Publish(body) => {
                let id = next_id;
                next_id += 1;
                pending.push_back(StoredMessage {
                    id,
                    attempts: 0,
                    body,
                });
            }
            Command::Subscribe(tx) => subscribers.push(tx),
            Command::Touch(id) => {
                if let Some(flight) = in_flight.get_mut(&id) {
                    flight.deadline = Instant::now() + timeout;
                }
            }
            Command::Finish(id) => {
                in_flight.remove(&id);
            }
            Command::Requeue(id, delay) => {
                if let Some(flight) = in_flight.remove(&id) {
                    delayed.push((Instant::now() + delay, flight.message));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_then_subscribe_delivers() {
        let broker = MemoryBroker::new(Duration::from_secs(30));
        broker.publish("t", b"one".to_vec()).await.unwrap();
        let mut rx = broker.subscribe("t", "c", 4).await.unwrap();
        let delivery = rx.recv().await.unwrap();
        assert_eq!(&delivery.body[..], b"one");
        assert_eq!(delivery.attempts, 1);
        delivery.finish().await;
    }

    #[tokio::test]
    async fn test_unfinished_message_is_redelivered_with_higher_attempts() {
        let broker = MemoryBroker::new(Duration::from_millis(50));
        let mut rx = broker.subscribe("t", "c", 4).await.unwrap();
        broker.publish("t", b"m".to_vec()).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.attempts, 1);
        // Never finished; broker times it out.
        let second = rx.recv().await.unwrap();
        assert_eq!(second.attempts, 2);
        second.finish().await;
    }

    #[tokio::test]
    async fn test_touch_defers_redelivery() {
        let broker = MemoryBroker::new(Duration::from_millis(80));
        let mut rx = broker.subscribe("t", "c", 4).await.unwrap();
        broker.publish("t", b"m".to_vec()).await.unwrap();

        let delivery = rx.recv().await.unwrap();
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            delivery.touch().await;
        }
        // Four touches kept it alive well past the timeout.
        assert!(rx.try_recv().is_err());
        delivery.finish().await;
    }

    #[tokio::test]
    async fn test_requeue_returns_message_after_delay() {
        let broker = MemoryBroker::new(Duration::from_secs(30));
        let mut rx = broker.subscribe("t", "c", 4).await.unwrap();
        broker.publish("t", b"m".to_vec()).await.unwrap();

        let delivery = rx.recv().await.unwrap();
        delivery.requeue(Duration::from_millis(30)).await;

        let redelivered = rx.recv().await.unwrap();
        assert_eq!(redelivered.attempts, 2);
        redelivered.finish().await;
    }
}
