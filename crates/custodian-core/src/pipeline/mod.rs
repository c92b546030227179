//! Stage-channel plumbing shared by every worker.
//!
//! # Architecture
//!
//! Each worker owns a fixed chain of bounded channels, one pool of tasks
//! per stage:
//!
//! ```text
//! broker → [ingress] → FetchChan → [N fetchers]  → ValidateChan
//!                      ValidateChan → [M validators] → ResultsChan
//!                      ...
//!                      ResultsChan → [loggers] → CleanupChan
//!                      CleanupChan → [cleaners] → broker Finish/Requeue
//! ```
//!
//! Channel capacity is pool size × 10. A full channel blocks the
//! upstream sender, so backpressure propagates from the slowest stage
//! back to the fetch pool, which in turn blocks on disk reservation.
//! Failures skip intermediate stages and jump straight to Results;
//! Results and Cleanup run for every envelope with valid JSON.

mod heartbeat;

pub use heartbeat::Heartbeat;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use crate::queue::{Broker, Delivery};

/// Shared receiver for multiple stage tasks pulling from one bounded
/// channel.
pub struct SharedReceiver<T> {
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> SharedReceiver<T> {
    pub fn new(rx: mpsc::Receiver<T>) -> Self {
        Self {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    pub async fn recv(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }
}

impl<T> Clone for SharedReceiver<T> {
    fn clone(&self) -> Self {
        Self { rx: self.rx.clone() }
    }
}

/// Spawn `count` tasks running `handler` over items from `rx`.
///
/// The pool drains until every sender is dropped; workers never cancel a
/// stage mid-item, shutdown is broker disconnect plus channel drain.
pub fn spawn_stage<T, F, Fut>(name: &'static str, count: usize, rx: SharedReceiver<T>, handler: F)
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Clone + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    for i in 0..count {
        let rx = rx.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            tracing::debug!(stage = name, worker = i, "Stage worker started");
            while let Some(item) = rx.recv().await {
                handler(item).await;
            }
            tracing::debug!(stage = name, worker = i, "Stage worker stopped");
        });
    }
}

/// Terminal fate of one delivery.
#[derive(Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Acknowledge; done (successfully or as a duplicate).
    Finish,
    /// Hand back for redelivery after the delay.
    Requeue(Duration),
    /// Acknowledge, then persist the envelope to the trouble topic.
    Trouble,
}

/// The retry policy every worker keys off `(error, retry, attempts)`.
pub fn classify(
    has_error: bool,
    retry: bool,
    attempts: u32,
    max_attempts: u32,
    requeue_delay: Duration,
) -> Disposition {
    if !has_error {
        Disposition::Finish
    } else if retry && attempts < max_attempts {
        Disposition::Requeue(requeue_delay)
    } else {
        Disposition::Trouble
    }
}

/// Apply a disposition: settle the broker message and, for
/// [`Disposition::Trouble`], publish the envelope to the trouble topic.
pub async fn settle<T: serde::Serialize>(
    broker: &dyn Broker,
    delivery: &Delivery,
    disposition: Disposition,
    trouble_topic: &str,
    envelope: &T,
) {
    match disposition {
        Disposition::Finish => delivery.finish().await,
        Disposition::Requeue(delay) => {
            tracing::info!(id = %delivery.id, delay_secs = delay.as_secs(), "Requeueing");
            delivery.requeue(delay).await;
        }
        Disposition::Trouble => {
            tracing::warn!(id = %delivery.id, topic = trouble_topic, "Routing to trouble");
            match serde_json::to_vec(envelope) {
                Ok(body) => {
                    if let Err(e) = broker.publish(trouble_topic, body).await {
                        tracing::error!(error = %e, "Cannot publish to trouble topic");
                    }
                }
                Err(e) => tracing::error!(error = %e, "Envelope not serializable"),
            }
            delivery.finish().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_success_finishes() {
        let d = classify(false, true, 1, 5, Duration::from_secs(60));
        assert_eq!(d, Disposition::Finish);
    }

    #[test]
    fn test_classify_transient_requeues_until_spent() {
        let delay = Duration::from_secs(60);
        assert_eq!(classify(true, true, 4, 5, delay), Disposition::Requeue(delay));
        assert_eq!(classify(true, true, 5, 5, delay), Disposition::Trouble);
    }

    #[test]
    fn test_classify_terminal_error_goes_to_trouble() {
        assert_eq!(
            classify(true, false, 1, 5, Duration::from_secs(60)),
            Disposition::Trouble
        );
    }

    #[tokio::test]
    async fn test_stage_pool_processes_all_items() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let (tx, rx) = mpsc::channel(40);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        spawn_stage("count", 4, SharedReceiver::new(rx), move |_item: u32| {
            let seen = seen_clone.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        for i in 0..100 {
            tx.send(i).await.unwrap();
        }
        drop(tx);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 100);
    }
}
