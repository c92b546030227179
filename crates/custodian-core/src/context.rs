//! Shared services handed to every worker.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::error::Error;
use crate::inflight::InFlightRegistry;
use crate::queue::Broker;
use crate::registry::Registry;
use crate::store::ObjectStore;
use crate::volume::DiskVolume;

/// One process's worth of shared state.
///
/// Built once at startup and passed (in an `Arc`) to every worker and
/// stage routine. The clients are read-only after start; the volume,
/// in-flight registry, and counters are the only mutable members and
/// carry their own synchronization.
pub struct ProcessContext {
    pub config: Config,
    pub store: Arc<dyn ObjectStore>,
    pub registry: Arc<dyn Registry>,
    pub broker: Arc<dyn Broker>,
    pub volume: DiskVolume,
    pub restore_volume: DiskVolume,
    pub inflight: InFlightRegistry,
    succeeded: AtomicU64,
    failed: AtomicU64,
    envelope_log: Mutex<Option<std::fs::File>>,
}

impl ProcessContext {
    pub fn new(
        config: Config,
        store: Arc<dyn ObjectStore>,
        registry: Arc<dyn Registry>,
        broker: Arc<dyn Broker>,
    ) -> Arc<Self> {
        let volume = DiskVolume::new(&config.staging_dir, config.max_disk_bytes);
        let restore_volume = DiskVolume::new(
            &config.restore_dir,
            config.max_restore_bytes.unwrap_or(config.max_disk_bytes),
        );
        Arc::new(Self {
            config,
            store,
            registry,
            broker,
            volume,
            restore_volume,
            inflight: InFlightRegistry::new(),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            envelope_log: Mutex::new(None),
        })
    }

    /// Claim an artifact for a broker message. See [`InFlightRegistry`].
    pub fn register_item(&self, key: &str, message_id: &str) -> Result<(), Error> {
        self.inflight.register(key, message_id)
    }

    pub fn unregister_item(&self, key: &str) {
        self.inflight.unregister(key);
    }

    pub fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counts(&self) -> (u64, u64) {
        (
            self.succeeded.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }

    /// Append one envelope to the worker's JSON log. Called on every
    /// terminal transition, success or failure.
    pub fn log_envelope<T: serde::Serialize>(&self, worker: &str, envelope: &T) {
        use std::io::Write as _;

        let mut guard = self.envelope_log.lock().unwrap();
        if guard.is_none() {
            let path = self.envelope_log_path(worker);
            match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => *guard = Some(file),
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "Cannot open envelope log");
                    return;
                }
            }
        }
        if let Some(file) = guard.as_mut() {
            match serde_json::to_string(envelope) {
                Ok(line) => {
                    if let Err(e) = writeln!(file, "{line}") {
                        tracing::error!(error = %e, "Envelope log write failed");
                    }
                }
                Err(e) => tracing::error!(error = %e, "Envelope not serializable"),
            }
        }
    }

    pub fn envelope_log_path(&self, worker: &str) -> PathBuf {
        self.config.log_dir.join(format!("{worker}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::memory::MemoryBroker;
    use crate::registry::MemoryRegistry;
    use crate::store::FsStore;
    use std::time::Duration;

    fn test_config(dir: &std::path::Path) -> Config {
        let toml = format!(
            r#"
staging_dir = "{0}/staging"
restore_dir = "{0}/restore"
log_dir = "{0}/logs"
max_disk_bytes = 1048576
receiving_bucket_prefix = "custodian.receive."
preservation_bucket = "custodian.preservation"
replication_bucket = "custodian.replication"
restoration_bucket_prefix = "custodian.restore."
registry_url = "http://localhost:3000"
registry_token = "secret"
broker_url = "memory"
"#,
            dir.display()
        );
        std::fs::write(dir.join("test.toml"), toml).unwrap();
        Config::load(dir, "test").unwrap()
    }

    #[tokio::test]
    async fn test_counters_and_registration() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        config.ensure_dirs().unwrap();
        let ctx = ProcessContext::new(
            config,
            Arc::new(FsStore::new(&dir.path().join("store"))),
            Arc::new(MemoryRegistry::new()),
            MemoryBroker::new(Duration::from_secs(30)),
        );

        ctx.register_item("bucket/key", "msg-1").unwrap();
        assert!(ctx.register_item("bucket/key", "msg-2").is_err());
        ctx.unregister_item("bucket/key");

        ctx.record_success();
        ctx.record_success();
        ctx.record_failure();
        assert_eq!(ctx.counts(), (2, 1));
    }

    #[tokio::test]
    async fn test_envelope_log_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        config.ensure_dirs().unwrap();
        let ctx = ProcessContext::new(
            config,
            Arc::new(FsStore::new(&dir.path().join("store"))),
            Arc::new(MemoryRegistry::new()),
            MemoryBroker::new(Duration::from_secs(30)),
        );

        ctx.log_envelope("prepare", &serde_json::json!({"a": 1}));
        ctx.log_envelope("prepare", &serde_json::json!({"a": 2}));
        let raw = std::fs::read_to_string(ctx.envelope_log_path("prepare")).unwrap();
        assert_eq!(raw.lines().count(), 2);
    }
}
