//! BagPreparer: fetch → unpack → validate.
//!
//! Consumes `S3File` envelopes from the prepare topic. Fetch reserves
//! twice the tar size (tar plus unpacked form) before the first byte,
//! so the fetch pool blocks on disk rather than ever seeing ENOSPC.
//! Content defects are terminal; network failures requeue.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::bag;
use crate::context::ProcessContext;
use crate::digests;
use crate::error::Error;
use crate::models::{FetchResult, GenericFile, PremisEvent, ProcessResult, S3File, Stage, TarResult};
use crate::pipeline::{classify, settle, spawn_stage, Heartbeat, SharedReceiver};
use crate::queue::{publish_json, Delivery};

use super::{topics, RESOURCE_RETRY_DELAY};

const WORKER_NAME: &str = "prepare";

struct Job {
    delivery: Delivery,
    result: ProcessResult,
    /// Bytes currently held against the staging volume.
    reserved: u64,
}

pub struct BagPreparer;

impl BagPreparer {
    /// Subscribe and run until the broker connection closes.
    pub async fn run(ctx: Arc<ProcessContext>) -> anyhow::Result<()> {
        let cfg = ctx.config.worker(WORKER_NAME);
        let mut deliveries = ctx
            .broker
            .subscribe(&cfg.topic, &cfg.channel, cfg.channel_capacity())
            .await?;

        let (fetch_tx, fetch_rx) = mpsc::channel::<Job>(cfg.fetchers * 10);
        let (validate_tx, validate_rx) = mpsc::channel::<Job>(cfg.channel_capacity());
        let (results_tx, results_rx) = mpsc::channel::<Job>(cfg.channel_capacity());
        let (cleanup_tx, cleanup_rx) = mpsc::channel::<Job>(cfg.channel_capacity());

        {
            let ctx = ctx.clone();
            let validate_tx = validate_tx.clone();
            let results_tx = results_tx.clone();
            spawn_stage("fetch", cfg.fetchers, SharedReceiver::new(fetch_rx), move |job| {
                fetch(ctx.clone(), validate_tx.clone(), results_tx.clone(), job)
            });
        }
        {
            let ctx = ctx.clone();
            let results_tx = results_tx.clone();
            spawn_stage("validate", cfg.workers, SharedReceiver::new(validate_rx), move |job| {
                validate(ctx.clone(), results_tx.clone(), job)
            });
        }
        {
            let ctx = ctx.clone();
            let cleanup_tx = cleanup_tx.clone();
            spawn_stage("results", cfg.workers, SharedReceiver::new(results_rx), move |job| {
                results(ctx.clone(), cleanup_tx.clone(), job)
            });
        }
        {
            let ctx = ctx.clone();
            let max_attempts = cfg.max_attempts;
            let requeue_delay = Duration::from_secs(cfg.requeue_delay_secs);
            spawn_stage("cleanup", cfg.workers, SharedReceiver::new(cleanup_rx), move |job| {
                cleanup(ctx.clone(), max_attempts, requeue_delay, job)
            });
        }

        tracing::info!(topic = %cfg.topic, fetchers = cfg.fetchers, workers = cfg.workers, "BagPreparer started");

        while let Some(delivery) = deliveries.recv().await {
            let s3_file: S3File = match delivery.parse() {
                Ok(s3_file) => s3_file,
                Err(e) => {
                    tracing::error!(id = %delivery.id, error = %e, "Unreadable envelope, discarding");
                    delivery.finish().await;
                    continue;
                }
            };
            let key = s3_file.identifier();
            if let Err(Error::AlreadyInProgress { message_id, .. }) =
                ctx.register_item(&key, &delivery.id)
            {
                tracing::info!(key = %key, holder = %message_id, "Duplicate delivery, finishing");
                delivery.finish().await;
                continue;
            }
            tracing::info!(key = %key, attempts = delivery.attempts, "Accepted bag for preparation");
            let job = Job {
                delivery,
                result: ProcessResult::new(s3_file),
                reserved: 0,
            };
            if fetch_tx.send(job).await.is_err() {
                anyhow::bail!("fetch channel closed");
            }
        }
        Ok(())
    }
}

fn tar_path(ctx: &ProcessContext, s3_file: &S3File) -> PathBuf {
    ctx.config.staging_dir.join(&s3_file.key)
}

fn unpack_dir(ctx: &ProcessContext, s3_file: &S3File) -> PathBuf {
    ctx.config
        .staging_dir
        .join(s3_file.key.strip_suffix(".tar").unwrap_or(&s3_file.key))
}

async fn fetch(
    ctx: Arc<ProcessContext>,
    validate_tx: mpsc::Sender<Job>,
    results_tx: mpsc::Sender<Job>,
    mut job: Job,
) {
    let s3_file = job.result.s3_file.clone();
    let needed = 2 * s3_file.size;

    // Disk pressure is not an envelope error: requeue untouched after a
    // short delay and let another bag go first.
    if let Err(e) = ctx.volume.reserve(needed) {
        tracing::info!(key = %s3_file.identifier(), error = %e, "No staging space, requeueing");
        ctx.unregister_item(&s3_file.identifier());
        job.delivery.requeue(RESOURCE_RETRY_DELAY).await;
        return;
    }
    job.reserved = needed;
    job.result.advance(Stage::Fetch);

    let dest = tar_path(&ctx, &s3_file);
    let fetched = {
        let _hb = Heartbeat::start(job.delivery.handle());
        ctx.store.get_to_file(&s3_file.bucket, &s3_file.key, &dest).await
    };
    if let Err(e) = fetched {
        job.result.fail(Stage::Fetch, &format!("Fetch of {} failed: {e}.", s3_file.key), true);
        let _ = results_tx.send(job).await;
        return;
    }

    let local_md5 = {
        let _hb = Heartbeat::start(job.delivery.handle());
        digests::md5_file(&dest).await
    };
    let local_md5 = match local_md5 {
        Ok(md5) => md5,
        Err(e) => {
            job.result.fail(Stage::Fetch, &format!("Cannot digest {}: {e}.", dest.display()), true);
            let _ = results_tx.send(job).await;
            return;
        }
    };

    // Single-part etags are MD5s; a mismatch means the bytes are not what
    // the institution uploaded, and re-fetching cannot fix that.
    if s3_file.etag_is_md5() && !local_md5.eq_ignore_ascii_case(&s3_file.etag) {
        job.result.fail(
            Stage::Fetch,
            &format!(
                "Downloaded {} does not match its etag: expected {}, got {local_md5}.",
                s3_file.key, s3_file.etag
            ),
            false,
        );
        let _ = results_tx.send(job).await;
        return;
    }

    job.result.fetch_result = Some(FetchResult {
        local_path: dest,
        remote_md5: s3_file.etag_is_md5().then(|| s3_file.etag.clone()),
        local_md5,
        bytes_fetched: s3_file.size,
    });
    tracing::info!(key = %s3_file.identifier(), "Fetched to staging");
    let _ = validate_tx.send(job).await;
}

async fn validate(ctx: Arc<ProcessContext>, results_tx: mpsc::Sender<Job>, mut job: Job) {
    let s3_file = job.result.s3_file.clone();
    let tar = tar_path(&ctx, &s3_file);
    let dest = unpack_dir(&ctx, &s3_file);

    job.result.advance(Stage::Unpack);
    let unpacked = {
        let _hb = Heartbeat::start(job.delivery.handle());
        bag::unpack(&tar, &dest).await
    };
    let bag_root = match unpacked {
        Ok(root) => root,
        Err(e) => {
            job.result.fail(Stage::Unpack, &format!("Cannot untar {}: {e}.", s3_file.key), false);
            let _ = results_tx.send(job).await;
            return;
        }
    };

    job.result.advance(Stage::Validate);
    let read = {
        let _hb = Heartbeat::start(job.delivery.handle());
        bag::read_bag(&bag_root).await
    };
    let read = match read {
        Ok(read) => read,
        Err(e) => {
            job.result.fail(Stage::Validate, &format!("Bag read failed: {e}."), true);
            let _ = results_tx.send(job).await;
            return;
        }
    };
    if let Err(e) = read.require_valid() {
        job.result.fail(Stage::Validate, &e.to_string(), false);
        job.result.bag_read_result = Some(read);
        let _ = results_tx.send(job).await;
        return;
    }

    let institution = s3_file.institution(&ctx.config.receiving_bucket_prefix).to_string();
    let bag_name = s3_file.bag_name();
    let generic_files = read
        .payload
        .iter()
        .map(|p| {
            let mut gf = GenericFile::new(
                &format!("{institution}/{bag_name}/{}", p.path),
                &p.path,
                p.size,
                &p.md5,
                &p.sha256,
                bag::mime_for(&p.path),
            );
            gf.md5_verified = true;
            gf.add_event(PremisEvent::identifier_assignment(&gf.uuid.to_string()));
            gf.add_event(PremisEvent::fixity_generation(&p.sha256));
            gf
        })
        .collect();

    job.result.tar_result = Some(TarResult {
        output_dir: bag_root,
        generic_files,
    });
    // Object-level events are minted here, exactly once, and travel in
    // the envelope; the recorder replays these identifiers on retries.
    let object_identifier = format!("{institution}/{bag_name}");
    job.result.object_events = vec![
        PremisEvent::identifier_assignment(&object_identifier),
        PremisEvent::ingest(&object_identifier, "bag"),
    ];
    job.result.bag_read_result = Some(read);
    job.result.succeed();
    tracing::info!(key = %s3_file.identifier(), "Bag validated");
    let _ = results_tx.send(job).await;
}

async fn results(ctx: Arc<ProcessContext>, cleanup_tx: mpsc::Sender<Job>, mut job: Job) {
    ctx.log_envelope(WORKER_NAME, &job.result);

    if job.result.has_errors() {
        ctx.record_failure();
        tracing::error!(
            key = %job.result.artifact_key(),
            stage = %job.result.stage,
            error = %job.result.error_message,
            "Preparation failed"
        );
    } else {
        // Hand the validated bag to the store topic.
        if let Err(e) = publish_json(ctx.broker.as_ref(), topics::STORE, &job.result).await {
            job.result.fail(Stage::Validate, &format!("Cannot enqueue for storage: {e}."), true);
            ctx.record_failure();
        } else {
            ctx.record_success();
        }
    }
    let _ = cleanup_tx.send(job).await;
}

async fn cleanup(ctx: Arc<ProcessContext>, max_attempts: u32, requeue_delay: Duration, mut job: Job) {
    let s3_file = job.result.s3_file.clone();
    let succeeded = !job.result.has_errors();

    // The tar is never needed again; the unpacked bag is the storer's
    // input and stays (with half the reservation) on success.
    let _ = tokio::fs::remove_file(tar_path(&ctx, &s3_file)).await;
    if succeeded {
        let keep = s3_file.size;
        ctx.volume.release(job.reserved.saturating_sub(keep));
        job.reserved = keep;
    } else {
        let _ = tokio::fs::remove_dir_all(unpack_dir(&ctx, &s3_file)).await;
        ctx.volume.release(job.reserved);
        job.reserved = 0;
    }

    let disposition = classify(
        job.result.has_errors(),
        job.result.retry,
        job.delivery.attempts,
        max_attempts,
        requeue_delay,
    );
    settle(ctx.broker.as_ref(), &job.delivery, disposition, topics::TROUBLE, &job.result).await;
    ctx.unregister_item(&s3_file.identifier());
}
