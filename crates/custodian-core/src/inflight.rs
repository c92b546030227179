//! At-most-once tracking for artifacts being processed.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::Error;

/// Process-wide map of artifact key → broker message id.
///
/// The broker redelivers anything that outlives its message timeout, so
/// every worker registers the artifact before doing work. A duplicate
/// delivery under a different message id gets `AlreadyInProgress` and is
/// finished without side effects; the original delivery still owns the
/// artifact and will emit the terminal disposition.
#[derive(Debug, Default)]
pub struct InFlightRegistry {
    items: Mutex<HashMap<String, String>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key` for `message_id`.
    ///
    /// Idempotent for the same message id, so a stage routine may
    /// re-register while passing an envelope down its own pipeline.
    pub fn register(&self, key: &str, message_id: &str) -> Result<(), Error> {
        let mut items = self.items.lock().unwrap();
        match items.get(key) {
            Some(existing) if existing != message_id => Err(Error::AlreadyInProgress {
                key: key.to_string(),
                message_id: existing.clone(),
            }),
            _ => {
                items.insert(key.to_string(), message_id.to_string());
                Ok(())
            }
        }
    }

    pub fn unregister(&self, key: &str) {
        self.items.lock().unwrap().remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.items.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent_for_same_message() {
        let registry = InFlightRegistry::new();
        registry.register("bucket/key.tar", "msg-1").unwrap();
        registry.register("bucket/key.tar", "msg-1").unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_delivery_is_rejected() {
        let registry = InFlightRegistry::new();
        registry.register("bucket/key.tar", "msg-1").unwrap();
        let err = registry.register("bucket/key.tar", "msg-2").unwrap_err();
        match err {
            Error::AlreadyInProgress { message_id, .. } => assert_eq!(message_id, "msg-1"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unregister_frees_the_key() {
        let registry = InFlightRegistry::new();
        registry.register("k", "msg-1").unwrap();
        registry.unregister("k");
        assert!(!registry.contains("k"));
        registry.register("k", "msg-2").unwrap();
    }
}
