//! Error types shared across the worker pipeline.
//!
//! Stage bodies work in `anyhow::Result` and attach context freely; these
//! typed variants exist for the cases the pipeline branches on (space
//! accounting, duplicate deliveries, content defects vs. transient faults).

use thiserror::Error;

/// Errors raised by the shared pipeline primitives.
#[derive(Debug, Error)]
pub enum Error {
    /// The staging volume cannot hold the requested reservation.
    #[error("insufficient space on {volume}: requested {requested} bytes, {available} available")]
    InsufficientSpace {
        volume: String,
        requested: u64,
        available: u64,
    },

    /// Another delivery of the same artifact is being processed right now.
    #[error("{key} is already in progress under message {message_id}")]
    AlreadyInProgress { key: String, message_id: String },

    /// The envelope body could not be deserialized.
    #[error("invalid envelope on topic {topic}: {source}")]
    BadEnvelope {
        topic: String,
        #[source]
        source: serde_json::Error,
    },

    /// A digest computed locally disagrees with the one we were promised.
    #[error("fixity mismatch for {subject}: expected {expected}, got {actual}")]
    FixityMismatch {
        subject: String,
        expected: String,
        actual: String,
    },

    /// The bag failed structural validation.
    #[error("bag validation failed: {0}")]
    BagInvalid(String),

    /// Required configuration is missing or unreadable. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a redelivery could plausibly succeed.
    ///
    /// Content defects (bad tars, digest mismatches) stay broken no matter
    /// how many times the broker hands them back.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            Error::FixityMismatch { .. } | Error::BagInvalid(_) | Error::BadEnvelope { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let space = Error::InsufficientSpace {
            volume: "/mnt/staging".into(),
            requested: 100,
            available: 10,
        };
        assert!(space.is_transient());

        let fixity = Error::FixityMismatch {
            subject: "test.edu/bag/data/file".into(),
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert!(!fixity.is_transient());

        let invalid = Error::BagInvalid("missing manifest".into());
        assert!(!invalid.is_transient());
    }
}
