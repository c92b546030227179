//! Environment configuration.
//!
//! Each daemon loads `config/<env>.toml` where `<env>` is one of
//! `dev|test|demo|production`, optionally followed by a KEY=VALUE env file
//! for secrets. Missing registry credentials are fatal at startup; workers
//! never limp along without a registry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::Error;

/// Per-worker tuning. Fetch pools are deliberately smaller than store
/// pools; fetch is disk-bound and blocks on volume reservation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub topic: String,
    pub channel: String,
    pub fetchers: usize,
    pub workers: usize,
    pub max_attempts: u32,
    pub message_timeout_secs: u64,
    pub requeue_delay_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            topic: String::new(),
            channel: "custodian".to_string(),
            fetchers: 2,
            workers: 4,
            max_attempts: 5,
            message_timeout_secs: 30 * 60,
            requeue_delay_secs: 60,
        }
    }
}

impl WorkerConfig {
    /// Stage channel capacity: pool size × 10.
    pub fn channel_capacity(&self) -> usize {
        self.workers * 10
    }
}

/// One peer node in the cross-node replication network.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub namespace: String,
    pub api_url: String,
    #[serde(default)]
    pub api_token: String,
}

/// Cross-node replication settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DpnConfig {
    /// Our own node namespace.
    pub local_node: String,
    pub staging_dir: PathBuf,
    /// Key prefix inside the preservation bucket for replicated bags.
    pub preservation_prefix: String,
    /// Timestamp file the request scanner uses for its `after=` filter.
    pub last_check_file: PathBuf,
    pub remote_nodes: Vec<NodeConfig>,
}

impl Default for DpnConfig {
    fn default() -> Self {
        Self {
            local_node: "custodian".to_string(),
            staging_dir: PathBuf::from("/mnt/custodian/dpn"),
            preservation_prefix: "dpn.preservation/".to_string(),
            last_check_file: PathBuf::from("dpn_last_request_check.txt"),
            remote_nodes: Vec::new(),
        }
    }
}

/// Full daemon configuration for one environment.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub environment: String,

    pub staging_dir: PathBuf,
    pub restore_dir: PathBuf,
    /// Trouble-sink files and JSON envelope logs land here.
    pub log_dir: PathBuf,
    /// DiskVolume capacity over `staging_dir`, in bytes.
    pub max_disk_bytes: u64,
    /// Capacity over `restore_dir`; defaults to `max_disk_bytes`.
    #[serde(default)]
    pub max_restore_bytes: Option<u64>,

    pub receiving_bucket_prefix: String,
    pub preservation_bucket: String,
    pub replication_bucket: String,
    pub restoration_bucket_prefix: String,

    pub registry_url: String,
    #[serde(default)]
    pub registry_token: String,

    pub broker_url: String,

    /// Root directory for the filesystem-backed object store used in
    /// dev/test/demo environments.
    #[serde(default = "default_store_root")]
    pub store_root: PathBuf,

    /// Upload attempts per file before the storer gives up on it.
    #[serde(default = "default_store_retries")]
    pub store_retries: u32,

    /// Files at or above this size upload multipart instead of in one PUT.
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: u64,

    /// Part size for multipart uploads.
    #[serde(default = "default_multipart_part_size")]
    pub multipart_part_size_bytes: u64,

    #[serde(default)]
    pub workers: HashMap<String, WorkerConfig>,

    #[serde(default)]
    pub dpn: DpnConfig,
}

fn default_store_retries() -> u32 {
    5
}

fn default_store_root() -> PathBuf {
    PathBuf::from("/var/custodian/store")
}

fn default_multipart_threshold() -> u64 {
    5 * 1024 * 1024 * 1024
}

fn default_multipart_part_size() -> u64 {
    200 * 1024 * 1024
}

impl Config {
    /// Load `<config_dir>/<env>.toml`.
    pub fn load(config_dir: &Path, env_name: &str) -> Result<Self, Error> {
        let path = config_dir.join(format!("{env_name}.toml"));
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let mut config: Config =
            toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.environment = env_name.to_string();
        config.apply_process_env();
        config.validate()?;
        Ok(config)
    }

    /// Read a KEY=VALUE file into the process environment, then re-apply
    /// overrides. Used for secrets that must not live in the TOML.
    pub fn apply_env_file(&mut self, path: &Path) -> Result<(), Error> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                std::env::set_var(key.trim(), value.trim());
            }
        }
        self.apply_process_env();
        self.validate()
    }

    fn apply_process_env(&mut self) {
        if let Ok(token) = std::env::var("CUSTODIAN_REGISTRY_TOKEN") {
            self.registry_token = token;
        }
        if let Ok(url) = std::env::var("CUSTODIAN_REGISTRY_URL") {
            self.registry_url = url;
        }
        if let Ok(url) = std::env::var("CUSTODIAN_BROKER_URL") {
            self.broker_url = url;
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.registry_url.is_empty() {
            return Err(Error::Config("registry_url is not set".into()));
        }
        if self.registry_token.is_empty() {
            return Err(Error::Config("registry_token is not set".into()));
        }
        Ok(())
    }

    /// Settings for one named worker, falling back to defaults with the
    /// worker name as topic.
    pub fn worker(&self, name: &str) -> WorkerConfig {
        self.workers.get(name).cloned().unwrap_or_else(|| WorkerConfig {
            topic: name.to_string(),
            ..WorkerConfig::default()
        })
    }

    /// Ensure the directories every worker assumes exist.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.staging_dir)?;
        std::fs::create_dir_all(&self.restore_dir)?;
        std::fs::create_dir_all(&self.log_dir)?;
        std::fs::create_dir_all(&self.dpn.staging_dir)?;
        Ok(())
    }

    /// Restoration bucket for one institution.
    pub fn restoration_bucket(&self, institution: &str) -> String {
        format!("{}{}", self.restoration_bucket_prefix, institution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests that read or clear CUSTODIAN_* variables must not interleave.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    const SAMPLE: &str = r#"
staging_dir = "/tmp/custodian/staging"
restore_dir = "/tmp/custodian/restore"
log_dir = "/tmp/custodian/logs"
max_disk_bytes = 536870912
receiving_bucket_prefix = "custodian.receive."
preservation_bucket = "custodian.preservation"
replication_bucket = "custodian.replication"
restoration_bucket_prefix = "custodian.restore."
registry_url = "http://localhost:3000"
registry_token = "secret"
broker_url = "http://localhost:4151"

[workers.prepare]
topic = "prepare"
fetchers = 2
workers = 4

[workers.store]
topic = "store"
workers = 8
message_timeout_secs = 10800
"#;

    #[test]
    fn test_load_from_toml() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("test.toml"), SAMPLE).unwrap();
        let config = Config::load(dir.path(), "test").unwrap();
        assert_eq!(config.environment, "test");
        assert_eq!(config.max_disk_bytes, 536_870_912);
        assert_eq!(config.worker("store").workers, 8);
        assert_eq!(config.worker("store").message_timeout_secs, 10_800);
        // Unknown workers fall back to defaults with the name as topic.
        assert_eq!(config.worker("fixity").topic, "fixity");
        assert_eq!(config.worker("prepare").channel_capacity(), 40);
    }

    #[test]
    fn test_missing_registry_token_is_fatal() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let stripped = SAMPLE.replace("registry_token = \"secret\"", "");
        std::fs::write(dir.path().join("dev.toml"), stripped).unwrap();
        std::env::remove_var("CUSTODIAN_REGISTRY_TOKEN");
        assert!(Config::load(dir.path(), "dev").is_err());
    }

    #[test]
    fn test_env_file_overrides_token() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("demo.toml"), SAMPLE).unwrap();
        let mut config = Config::load(dir.path(), "demo").unwrap();

        let env_file = dir.path().join("secrets.env");
        std::fs::write(&env_file, "CUSTODIAN_REGISTRY_TOKEN=rotated\n# comment\n").unwrap();
        config.apply_env_file(&env_file).unwrap();
        assert_eq!(config.registry_token, "rotated");
        std::env::remove_var("CUSTODIAN_REGISTRY_TOKEN");
    }

    #[test]
    fn test_restoration_bucket_name() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("test.toml"), SAMPLE).unwrap();
        let config = Config::load(dir.path(), "test").unwrap();
        assert_eq!(config.restoration_bucket("test.edu"), "custodian.restore.test.edu");
    }
}
