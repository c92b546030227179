//! End-to-end ingest pipeline tests over the in-process broker.

mod common;

use std::sync::Arc;

use custodian_core::bag;
use custodian_core::models::{EventType, Stage, Status};
use custodian_core::queue::publish_json;
use custodian_core::store::{ObjectStore, PutOptions};
use custodian_core::workers::{
    topics, BagPreparer, BagRecorder, BagRestorer, BagStorer, CleanupWorker, TroubleProcessor,
};

use common::{harness, harness_wrapped, seed_bag, seed_tar, wait_until, Harness, RECEIVING_BUCKET};

fn spawn_ingest_workers(h: &Harness) {
    tokio::spawn(BagPreparer::run(h.ctx.clone()));
    tokio::spawn(BagStorer::run(h.ctx.clone()));
    tokio::spawn(BagRecorder::run(h.ctx.clone()));
    tokio::spawn(CleanupWorker::run(h.ctx.clone()));
    let ctx = h.ctx.clone();
    tokio::spawn(async move { TroubleProcessor::run(ctx, topics::TROUBLE).await });
}

#[tokio::test]
async fn test_happy_path_ingest() {
    let h = harness(100 * 1024 * 1024);
    spawn_ingest_workers(&h);

    let s3_file = seed_bag(
        &h,
        "good_bag",
        &[("hello.txt", b"hello\n"), ("sub/world.txt", b"world\n")],
    )
    .await;
    publish_json(h.broker.as_ref(), topics::PREPARE, &s3_file).await.unwrap();

    // The work-log row resolves once cleanup has emptied the receiving
    // bucket.
    let registry = h.registry.clone();
    wait_until("ingest to complete", move || {
        registry
            .statuses()
            .iter()
            .any(|s| s.stage == Stage::Cleanup && s.status == Status::Success)
    })
    .await;

    // Receiving bucket is empty.
    assert!(h
        .store
        .head(RECEIVING_BUCKET, "good_bag.tar")
        .await
        .unwrap()
        .is_none());

    // Registry has the object with both files, three events each, and
    // object-level events.
    let object = h.registry.object("test.edu/good_bag").expect("object registered");
    assert_eq!(object.files.len(), 2);
    for gf in &object.files {
        assert!(gf.is_stored());
        assert_eq!(gf.storage_md5, gf.md5);
        assert!(gf.events.len() >= 2, "{} has {} events", gf.identifier, gf.events.len());
        assert!(gf.events.iter().any(|e| e.event_type == EventType::Ingest));
        assert!(gf
            .events
            .iter()
            .any(|e| e.event_type == EventType::IdentifierAssignment));

        // One preservation key per file, integrity-checked on the way in.
        let meta = h
            .store
            .head("custodian.preservation", &gf.storage_key())
            .await
            .unwrap()
            .expect("preservation key exists");
        assert_eq!(meta.etag, gf.md5);
    }
    assert!(!h.registry.object_events("test.edu/good_bag").is_empty());

    // Nothing left on the staging volume once the storer settles.
    let ctx = h.ctx.clone();
    wait_until("staging volume to drain", move || ctx.volume.reserved() == 0).await;
}

#[tokio::test]
async fn test_duplicate_delivery_is_rejected_without_side_effects() {
    let h = harness(100 * 1024 * 1024);
    tokio::spawn(BagStorer::run(h.ctx.clone()));

    let s3_file = seed_bag(&h, "dup_bag", &[("a.txt", b"alpha\n")]).await;
    let mut result = custodian_core::models::ProcessResult::new(s3_file);
    result.tar_result = Some(custodian_core::models::TarResult {
        output_dir: h.dir.path().join("nowhere"),
        generic_files: vec![],
    });

    // Another message already owns this artifact.
    h.ctx.register_item(&result.artifact_key(), "someone-else").unwrap();
    publish_json(h.broker.as_ref(), topics::STORE, &result).await.unwrap();

    // The delivery finishes as a duplicate; the holder keeps the claim.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert!(h.ctx.inflight.contains(&result.artifact_key()));
    assert_eq!(h.registry.call_count("get_object"), 0);

    // Once the original releases the claim, a redelivery is accepted.
    h.ctx.unregister_item(&result.artifact_key());
    publish_json(h.broker.as_ref(), topics::STORE, &result).await.unwrap();
    let registry = h.registry.clone();
    wait_until("redelivery to be processed", move || {
        registry.call_count("get_object") > 0
    })
    .await;
}

#[tokio::test]
async fn test_disk_starvation_blocks_but_completes() {
    // Four bags, each reserving 2x its tar size; capacity fits two
    // reservations at a time. All must still drain through cleanup.
    let probe = harness(100 * 1024 * 1024);
    let payload = vec![0xabu8; 4096];
    let s3_file = seed_bag(&probe, "probe", &[("data.bin", &payload)]).await;
    let tar_size = s3_file.size;
    drop(probe);

    let h = harness(tar_size * 5);
    spawn_ingest_workers(&h);

    let mut envelopes = Vec::new();
    for i in 0..4 {
        envelopes.push(seed_bag(&h, &format!("big_{i}"), &[("data.bin", &payload)]).await);
    }
    for envelope in &envelopes {
        publish_json(h.broker.as_ref(), topics::PREPARE, envelope).await.unwrap();
    }

    let registry = h.registry.clone();
    wait_until("all four bags to complete", move || {
        registry
            .statuses()
            .iter()
            .filter(|s| s.stage == Stage::Cleanup && s.status == Status::Success)
            .count()
            == 4
    })
    .await;
    let ctx = h.ctx.clone();
    wait_until("staging volume to drain", move || ctx.volume.reserved() == 0).await;
}

#[tokio::test]
async fn test_untar_failure_is_terminal() {
    let h = harness(100 * 1024 * 1024);
    spawn_ingest_workers(&h);

    // A tar whose contents are garbage: fetch succeeds (etag matches the
    // bytes as uploaded), untar cannot.
    let broken = h.dir.path().join("broken.tar");
    tokio::fs::write(&broken, b"this is not a tar archive at all")
        .await
        .unwrap();
    let s3_file = seed_tar(&h, "broken", &broken).await;
    publish_json(h.broker.as_ref(), topics::PREPARE, &s3_file).await.unwrap();

    // Terminal: exactly one trouble file, no registry writes.
    let sink = TroubleProcessor::sink_path(&h.ctx, topics::TROUBLE, &s3_file.identifier());
    let sink_probe = sink.clone();
    wait_until("trouble file to appear", move || sink_probe.exists()).await;

    let raw = tokio::fs::read_to_string(&sink).await.unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["stage"], "unpack");
    assert_eq!(value["retry"], false);
    assert!(value["error_message"].as_str().unwrap().contains("untar"));

    assert!(h.registry.object("test.edu/broken").is_none());
    assert_eq!(h.registry.call_count("create_object"), 0);
    let ctx = h.ctx.clone();
    wait_until("staging volume to drain", move || ctx.volume.reserved() == 0).await;
}

/// Object store wrapper that refuses to accept named payload files and
/// counts upload attempts per source path.
struct FlakyStore {
    inner: Arc<custodian_core::store::FsStore>,
    poison: &'static str,
    puts: std::sync::Mutex<std::collections::HashMap<String, usize>>,
}

impl FlakyStore {
    fn new(inner: Arc<custodian_core::store::FsStore>, poison: &'static str) -> Self {
        Self {
            inner,
            poison,
            puts: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn note_put(&self, src: &std::path::Path) {
        *self
            .puts
            .lock()
            .unwrap()
            .entry(src.to_string_lossy().into_owned())
            .or_insert(0) += 1;
    }

    /// Upload attempts whose source path contains `needle`.
    fn put_count(&self, needle: &str) -> usize {
        self.puts
            .lock()
            .unwrap()
            .iter()
            .filter(|(path, _)| path.contains(needle))
            .map(|(_, count)| count)
            .sum()
    }
}

#[async_trait::async_trait]
impl ObjectStore for FlakyStore {
    async fn head(
        &self,
        bucket: &str,
        key: &str,
    ) -> anyhow::Result<Option<custodian_core::store::ObjectMeta>> {
        self.inner.head(bucket, key).await
    }

    async fn get_to_file(
        &self,
        bucket: &str,
        key: &str,
        dest: &std::path::Path,
    ) -> anyhow::Result<custodian_core::store::ObjectMeta> {
        self.inner.get_to_file(bucket, key, dest).await
    }

    async fn put_file(
        &self,
        bucket: &str,
        key: &str,
        src: &std::path::Path,
        opts: &PutOptions,
    ) -> anyhow::Result<String> {
        self.note_put(src);
        if src.to_string_lossy().contains(self.poison) {
            anyhow::bail!("500 Internal Server Error");
        }
        self.inner.put_file(bucket, key, src, opts).await
    }

    async fn put_file_multipart(
        &self,
        bucket: &str,
        key: &str,
        src: &std::path::Path,
        part_size: u64,
        opts: &PutOptions,
    ) -> anyhow::Result<String> {
        self.note_put(src);
        if src.to_string_lossy().contains(self.poison) {
            anyhow::bail!("500 Internal Server Error");
        }
        self.inner.put_file_multipart(bucket, key, src, part_size, opts).await
    }

    async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> anyhow::Result<()> {
        self.inner.copy_object(src_bucket, src_key, dst_bucket, dst_key).await
    }

    async fn delete(&self, bucket: &str, key: &str) -> anyhow::Result<()> {
        self.inner.delete(bucket, key).await
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> anyhow::Result<Vec<custodian_core::store::ObjectMeta>> {
        self.inner.list(bucket, prefix).await
    }

    fn url_for(&self, bucket: &str, key: &str) -> String {
        self.inner.url_for(bucket, key)
    }
}

#[tokio::test]
async fn test_partial_storage_lands_in_trouble_with_ledger() {
    let h = harness_wrapped(100 * 1024 * 1024, |inner| {
        Arc::new(FlakyStore::new(inner, "poison"))
    });
    spawn_ingest_workers(&h);

    let s3_file = seed_bag(
        &h,
        "mixed_bag",
        &[
            ("good_1.txt", b"one\n".as_slice()),
            ("good_2.txt", b"two\n".as_slice()),
            ("poison_3.txt", b"three\n".as_slice()),
            ("poison_4.txt", b"four\n".as_slice()),
            ("poison_5.txt", b"five\n".as_slice()),
        ],
    )
    .await;
    publish_json(h.broker.as_ref(), topics::PREPARE, &s3_file).await.unwrap();

    let sink = TroubleProcessor::sink_path(&h.ctx, topics::TROUBLE, &s3_file.identifier());
    let sink_probe = sink.clone();
    wait_until("envelope to exhaust retries", move || sink_probe.exists()).await;

    let raw = tokio::fs::read_to_string(&sink).await.unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["stage"], "store");
    assert!(value["error_message"]
        .as_str()
        .unwrap()
        .contains("Incomplete copy"));

    // The per-file ledger shows two OKs and three errors.
    let calls = value["fedora_result"]["calls"].as_array().unwrap();
    let (ok, failed): (Vec<_>, Vec<_>) = calls.iter().partition(|c| c["error"].is_null());
    assert_eq!(ok.len(), 2);
    assert_eq!(failed.len(), 3);

    // The two good files stay in the preservation bucket.
    let listed = h.store.list("custodian.preservation", "").await.unwrap();
    assert_eq!(listed.len(), 2);
}

#[tokio::test]
async fn test_multipart_resume_skips_already_stored_files() {
    // A multipart upload's etag is not an MD5, so the redelivery resume
    // check must recognize the completed copy by its stored size.
    let captured: Arc<std::sync::OnceLock<Arc<FlakyStore>>> = Arc::new(std::sync::OnceLock::new());
    let captured_setter = captured.clone();
    let h = harness_wrapped(100 * 1024 * 1024, move |inner| {
        let flaky = Arc::new(FlakyStore::new(inner, "poison"));
        let _ = captured_setter.set(flaky.clone());
        flaky
    });
    let flaky = captured.get().unwrap().clone();
    spawn_ingest_workers(&h);

    // big.bin crosses the configured multipart threshold (1024 bytes);
    // the poison file keeps failing so the envelope redelivers.
    let big = vec![0x5au8; 2048];
    let s3_file = seed_bag(
        &h,
        "resume_bag",
        &[("big.bin", big.as_slice()), ("poison.txt", b"x".as_slice())],
    )
    .await;
    publish_json(h.broker.as_ref(), topics::PREPARE, &s3_file).await.unwrap();

    let sink = TroubleProcessor::sink_path(&h.ctx, topics::TROUBLE, &s3_file.identifier());
    let sink_probe = sink.clone();
    wait_until("envelope to exhaust retries", move || sink_probe.exists()).await;

    // Two delivery attempts, but the multipart file went up exactly once;
    // the second attempt recognized the stored copy and skipped it.
    assert_eq!(flaky.put_count("big.bin"), 1);
    assert!(h
        .store
        .head("custodian.preservation", &preserved_key(&h, "big.bin"))
        .await
        .unwrap()
        .is_some());
}

/// Storage key the ingest assigned to one payload file, read back from
/// the trouble envelope's file list.
fn preserved_key(h: &Harness, path_suffix: &str) -> String {
    let sink = TroubleProcessor::sink_path(
        &h.ctx,
        topics::TROUBLE,
        "custodian.receive.test.edu/resume_bag.tar",
    );
    let raw = std::fs::read_to_string(sink).unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    value["tar_result"]["generic_files"]
        .as_array()
        .unwrap()
        .iter()
        .find(|gf| gf["path"].as_str().unwrap().ends_with(path_suffix))
        .and_then(|gf| gf["uuid"].as_str())
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn test_record_retry_does_not_duplicate_object_events() {
    let h = harness(100 * 1024 * 1024);
    spawn_ingest_workers(&h);

    // The work-log save is the recorder's last step; breaking it lets
    // the object and its events land, then forces a second recording
    // attempt over the same envelope.
    h.registry.break_method("save_status");

    let s3_file = seed_bag(&h, "retry_bag", &[("a.txt", b"alpha\n")]).await;
    publish_json(h.broker.as_ref(), topics::PREPARE, &s3_file).await.unwrap();

    let registry = h.registry.clone();
    wait_until("first recording attempt to fail", move || {
        registry.call_count("save_status") >= 1
    })
    .await;
    h.registry.heal();

    let registry = h.registry.clone();
    wait_until("retried ingest to complete", move || {
        registry
            .statuses()
            .iter()
            .any(|s| s.stage == Stage::Cleanup && s.status == Status::Success)
    })
    .await;

    // The retry replayed the same event identifiers, so the registry
    // deduped: one identifier_assignment, one ingest, nothing more.
    let events = h.registry.object_events("test.edu/retry_bag");
    let assignments = events
        .iter()
        .filter(|e| e.event_type == EventType::IdentifierAssignment)
        .count();
    let ingests = events.iter().filter(|e| e.event_type == EventType::Ingest).count();
    assert_eq!((assignments, ingests), (1, 1), "duplicate object events: {events:?}");

    // File-level events deduped the same way.
    let object = h.registry.object("test.edu/retry_bag").unwrap();
    for gf in &object.files {
        let ingests = gf.events.iter().filter(|e| e.event_type == EventType::Ingest).count();
        assert_eq!(ingests, 1, "{} has duplicate ingest events", gf.identifier);
    }
}

#[tokio::test]
async fn test_restore_round_trips_digests() {
    let h = harness(100 * 1024 * 1024);
    spawn_ingest_workers(&h);
    tokio::spawn(BagRestorer::run(h.ctx.clone()));

    let files: &[(&str, &[u8])] = &[("a.txt", b"alpha\n"), ("nested/b.txt", b"beta\n")];
    let s3_file = seed_bag(&h, "round_trip", files).await;
    publish_json(h.broker.as_ref(), topics::PREPARE, &s3_file).await.unwrap();

    let registry = h.registry.clone();
    wait_until("ingest to complete", move || {
        registry
            .statuses()
            .iter()
            .any(|s| s.stage == Stage::Cleanup && s.status == Status::Success)
    })
    .await;

    let original = h.registry.object("test.edu/round_trip").unwrap();

    // Ask for the object back.
    let mut request = h.registry.statuses().into_iter().next().unwrap();
    request.action = custodian_core::models::Action::Restore;
    request.object_identifier = "test.edu/round_trip".to_string();
    publish_json(h.broker.as_ref(), topics::RESTORE, &request).await.unwrap();

    let store = h.store.clone();
    let registry = h.registry.clone();
    wait_until("restore to resolve", move || {
        registry
            .statuses()
            .iter()
            .any(|s| s.stage == Stage::Resolve && s.status == Status::Success)
    })
    .await;

    // Pull the restored tar, unpack, and compare digests per file.
    let restored_tar = h.dir.path().join("restored.tar");
    store
        .get_to_file("custodian.restore.test.edu", "round_trip.tar", &restored_tar)
        .await
        .unwrap();
    let unpack_dir = h.dir.path().join("restored_unpacked");
    let root = bag::unpack(&restored_tar, &unpack_dir).await.unwrap();
    let read = bag::read_bag(&root).await.unwrap();
    assert!(read.errors.is_empty(), "{:?}", read.errors);
    assert_eq!(read.payload.len(), original.files.len());
    for payload in &read.payload {
        let gf = original
            .files
            .iter()
            .find(|f| f.path == payload.path)
            .expect("restored file was in the original bag");
        assert_eq!(payload.sha256, gf.sha256, "digest drift on {}", payload.path);
    }
}

#[tokio::test]
async fn test_unchanged_reingest_uploads_nothing() {
    let h = harness(100 * 1024 * 1024);
    spawn_ingest_workers(&h);

    let files: &[(&str, &[u8])] = &[("same.txt", b"stable content\n")];
    let s3_file = seed_bag(&h, "stable_bag", files).await;
    publish_json(h.broker.as_ref(), topics::PREPARE, &s3_file).await.unwrap();

    let registry = h.registry.clone();
    wait_until("first ingest to complete", move || {
        registry
            .statuses()
            .iter()
            .any(|s| s.stage == Stage::Cleanup && s.status == Status::Success)
    })
    .await;
    let keys_after_first = h.store.list("custodian.preservation", "").await.unwrap();

    // Same bytes again, as a fresh upload.
    let s3_file = seed_bag(&h, "stable_bag", files).await;
    publish_json(h.broker.as_ref(), topics::PREPARE, &s3_file).await.unwrap();

    let registry = h.registry.clone();
    wait_until("re-ingest to complete", move || {
        registry
            .statuses()
            .iter()
            .filter(|s| s.stage == Stage::Cleanup && s.status == Status::Success)
            .count()
            >= 2
    })
    .await;

    // The diff found nothing to save: the preservation bucket is
    // byte-for-byte the same set of keys.
    let keys_after_second = h.store.list("custodian.preservation", "").await.unwrap();
    assert_eq!(
        keys_after_first
            .iter()
            .map(|m| m.key.clone())
            .collect::<Vec<_>>(),
        keys_after_second
            .iter()
            .map(|m| m.key.clone())
            .collect::<Vec<_>>()
    );
}
