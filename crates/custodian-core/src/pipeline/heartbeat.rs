//! Broker heartbeats for long operations.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::queue::MessageHandle;

/// Default tick: well under the shortest broker message timeout.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Touches the broker message on an interval for as long as it lives.
///
/// Wrap any operation expected to exceed thirty seconds (fetch, untar,
/// per-file store, multipart upload):
///
/// ```ignore
/// let _hb = Heartbeat::start(delivery.handle());
/// long_download().await?;
/// // dropped here; the timer cannot outlive the operation
/// ```
pub struct Heartbeat {
    task: JoinHandle<()>,
}

impl Heartbeat {
    pub fn start(handle: Arc<dyn MessageHandle>) -> Self {
        Self::with_interval(handle, HEARTBEAT_INTERVAL)
    }

    pub fn with_interval(handle: Arc<dyn MessageHandle>, interval: Duration) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick would touch before any work happened.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                handle.touch().await;
            }
        });
        Self { task }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandle {
        touches: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandle for CountingHandle {
        async fn touch(&self) {
            self.touches.fetch_add(1, Ordering::SeqCst);
        }
        async fn finish(&self) {}
        async fn requeue(&self, _delay: Duration) {}
    }

    #[tokio::test]
    async fn test_heartbeat_touches_then_stops_on_drop() {
        let handle = Arc::new(CountingHandle {
            touches: AtomicUsize::new(0),
        });
        {
            let _hb = Heartbeat::with_interval(handle.clone(), Duration::from_millis(20));
            tokio::time::sleep(Duration::from_millis(110)).await;
        }
        let after_drop = handle.touches.load(Ordering::SeqCst);
        assert!(after_drop >= 3, "expected several touches, got {after_drop}");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(handle.touches.load(Ordering::SeqCst), after_drop);
    }
}
