//! Shared fixtures: a full in-process pipeline over the memory broker,
//! the filesystem object store, and the in-memory registry.
#![allow(dead_code)] // not every test binary uses every fixture

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use custodian_core::config::Config;
use custodian_core::digests;
use custodian_core::models::S3File;
use custodian_core::queue::memory::MemoryBroker;
use custodian_core::registry::MemoryRegistry;
use custodian_core::store::{FsStore, ObjectStore, PutOptions};
use custodian_core::ProcessContext;

pub const RECEIVING_BUCKET: &str = "custodian.receive.test.edu";

pub struct Harness {
    pub ctx: Arc<ProcessContext>,
    pub broker: Arc<MemoryBroker>,
    pub registry: Arc<MemoryRegistry>,
    pub store: Arc<FsStore>,
    pub dir: tempfile::TempDir,
}

/// Build a context over temp dirs. `max_disk_bytes` bounds the staging
/// volume; worker retry knobs are tightened so failure tests run fast.
pub fn harness(max_disk_bytes: u64) -> Harness {
    harness_wrapped(max_disk_bytes, |store| store)
}

/// Same, but lets a test wrap the object store (e.g. to inject faults)
/// while keeping direct `FsStore` access for seeding.
pub fn harness_wrapped<F>(max_disk_bytes: u64, wrap: F) -> Harness
where
    F: FnOnce(Arc<FsStore>) -> Arc<dyn ObjectStore>,
{
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FsStore::new(&dir.path().join("object_store")));
    let (ctx, broker, registry) = build_context(&dir, max_disk_bytes, wrap(store.clone()));
    Harness {
        ctx,
        broker,
        registry,
        store,
        dir,
    }
}

pub fn build_context(
    dir: &tempfile::TempDir,
    max_disk_bytes: u64,
    store: Arc<dyn ObjectStore>,
) -> (Arc<ProcessContext>, Arc<MemoryBroker>, Arc<MemoryRegistry>) {
    let toml = format!(
        r#"
staging_dir = "{root}/staging"
restore_dir = "{root}/restore"
log_dir = "{root}/logs"
max_disk_bytes = {max_disk_bytes}
receiving_bucket_prefix = "custodian.receive."
preservation_bucket = "custodian.preservation"
replication_bucket = "custodian.replication"
restoration_bucket_prefix = "custodian.restore."
registry_url = "http://localhost:3000"
registry_token = "secret"
broker_url = "memory"
store_root = "{root}/object_store"
# Low thresholds so small fixtures exercise the multipart path.
multipart_threshold_bytes = 1024
multipart_part_size_bytes = 512

[dpn]
local_node = "custodian"
staging_dir = "{root}/dpn"
preservation_prefix = "dpn.preservation/"
last_check_file = "{root}/dpn/last_check.txt"
remote_nodes = []

[workers.prepare]
topic = "prepare"
fetchers = 2
workers = 2
max_attempts = 2
requeue_delay_secs = 0

[workers.store]
topic = "store"
workers = 2
max_attempts = 2
requeue_delay_secs = 0

[workers.record]
topic = "record"
workers = 2
max_attempts = 3
requeue_delay_secs = 1

[workers.cleanup]
topic = "cleanup"
workers = 2
max_attempts = 2
requeue_delay_secs = 0

[workers.restore]
topic = "restore"
workers = 2
max_attempts = 2
requeue_delay_secs = 0
"#,
        root = dir.path().display(),
    );
    std::fs::write(dir.path().join("test.toml"), toml).unwrap();
    let config = Config::load(dir.path(), "test").unwrap();
    config.ensure_dirs().unwrap();

    let broker = MemoryBroker::new(Duration::from_secs(30));
    let registry = Arc::new(MemoryRegistry::new());
    let ctx = ProcessContext::new(config, store, registry.clone(), broker.clone());
    (ctx, broker, registry)
}

/// Build a valid bag, tar it, and drop the tar into the receiving
/// bucket. Returns the envelope the bucket scanner would enqueue.
pub async fn seed_bag(
    harness: &Harness,
    bag_name: &str,
    files: &[(&str, &[u8])],
) -> S3File {
    let scratch = harness.dir.path().join(format!("seed_{bag_name}"));
    let bag_dir = scratch.join(bag_name);
    tokio::fs::create_dir_all(bag_dir.join("data")).await.unwrap();

    tokio::fs::write(
        bag_dir.join("bagit.txt"),
        "BagIt-Version: 0.97\nTag-File-Character-Encoding: UTF-8\n",
    )
    .await
    .unwrap();
    tokio::fs::write(
        bag_dir.join("bag-info.txt"),
        "Source-Organization: Test University\n",
    )
    .await
    .unwrap();
    tokio::fs::write(
        bag_dir.join("aptrust-info.txt"),
        format!("Title: {bag_name}\nAccess: institution\n"),
    )
    .await
    .unwrap();

    let mut manifest_md5 = String::new();
    let mut manifest_sha256 = String::new();
    for (rel, content) in files {
        let dest = bag_dir.join("data").join(rel);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap();
        }
        tokio::fs::write(&dest, content).await.unwrap();
        let (md5, sha256) = digests::md5_and_sha256(&dest).await.unwrap();
        manifest_md5.push_str(&format!("{md5} data/{rel}\n"));
        manifest_sha256.push_str(&format!("{sha256} data/{rel}\n"));
    }
    tokio::fs::write(bag_dir.join("manifest-md5.txt"), manifest_md5).await.unwrap();
    tokio::fs::write(bag_dir.join("manifest-sha256.txt"), manifest_sha256)
        .await
        .unwrap();

    let tar = scratch.join(format!("{bag_name}.tar"));
    custodian_core::bag::pack(&bag_dir, &tar, bag_name).await.unwrap();
    seed_tar(harness, bag_name, &tar).await
}

/// Put an arbitrary tar into the receiving bucket.
pub async fn seed_tar(harness: &Harness, bag_name: &str, tar: &PathBuf) -> S3File {
    let key = format!("{bag_name}.tar");
    let etag = harness
        .store
        .put_file(RECEIVING_BUCKET, &key, tar, &PutOptions::default())
        .await
        .unwrap();
    let size = tokio::fs::metadata(tar).await.unwrap().len();
    S3File {
        bucket: RECEIVING_BUCKET.to_string(),
        key,
        size,
        last_modified: Utc::now(),
        etag,
    }
}

/// Poll until `check` passes or the timeout expires.
pub async fn wait_until<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    loop {
        if check() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
