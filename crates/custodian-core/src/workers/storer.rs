//! BagStorer: copy validated payload files to the preservation bucket.
//!
//! The diff against the registry decides which files actually upload; an
//! unchanged re-ingest performs zero uploads. Mixed per-file outcomes
//! leave an incomplete copy: the envelope requeues (already-stored files
//! are skipped on the next pass) and lands in trouble once attempts run
//! out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::context::ProcessContext;
use crate::error::Error;
use crate::models::{
    EntityType, FedoraResult, GenericFile, ProcessResult, RegistryAction, Stage,
};
use crate::pipeline::{classify, settle, spawn_stage, Heartbeat, SharedReceiver};
use crate::queue::{publish_json, Delivery};
use crate::store::PutOptions;

use super::topics;

const WORKER_NAME: &str = "store";

struct Job {
    delivery: Delivery,
    result: ProcessResult,
}

pub struct BagStorer;

impl BagStorer {
    pub async fn run(ctx: Arc<ProcessContext>) -> anyhow::Result<()> {
        let cfg = ctx.config.worker(WORKER_NAME);
        let mut deliveries = ctx
            .broker
            .subscribe(&cfg.topic, &cfg.channel, cfg.channel_capacity())
            .await?;

        let (store_tx, store_rx) = mpsc::channel::<Job>(cfg.channel_capacity());
        let (results_tx, results_rx) = mpsc::channel::<Job>(cfg.channel_capacity());
        let (cleanup_tx, cleanup_rx) = mpsc::channel::<Job>(cfg.channel_capacity());

        {
            let ctx = ctx.clone();
            let results_tx = results_tx.clone();
            spawn_stage("store", cfg.workers, SharedReceiver::new(store_rx), move |job| {
                store(ctx.clone(), results_tx.clone(), job)
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

        tracing::info!(topic = %cfg.topic, workers = cfg.workers, "BagStorer started");

        while let Some(delivery) = deliveries.recv().await {
            let result: ProcessResult = match delivery.parse() {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(id = %delivery.id, error = %e, "Unreadable envelope, discarding");
                    delivery.finish().await;
                    continue;
                }
            };
            let key = result.artifact_key();
            if let Err(Error::AlreadyInProgress { message_id, .. }) =
                ctx.register_item(&key, &delivery.id)
            {
                tracing::info!(key = %key, holder = %message_id, "Duplicate delivery, finishing");
                delivery.finish().await;
                continue;
            }
            if store_tx.send(Job { delivery, result }).await.is_err() {
                anyhow::bail!("store channel closed");
            }
        }
        Ok(())
    }
}

async fn store(ctx: Arc<ProcessContext>, results_tx: mpsc::Sender<Job>, mut job: Job) {
    job.result.advance(Stage::Store);

    let s3_file = job.result.s3_file.clone();
    let institution = s3_file.institution(&ctx.config.receiving_bucket_prefix).to_string();
    let bag_name = s3_file.bag_name().to_string();
    let object_identifier = format!("{institution}/{bag_name}");

    if job.result.tar_result.is_none() {
        job.result.fail(Stage::Store, "Envelope has no unpacked bag to store.", false);
        let _ = results_tx.send(job).await;
        return;
    }

    // Diff against the registry's current view of this object.
    let registry_view = match ctx.registry.get_object(&object_identifier, true).await {
        Ok(view) => view,
        Err(e) => {
            job.result.fail(Stage::Store, &format!("Registry diff failed: {e}."), true);
            let _ = results_tx.send(job).await;
            return;
        }
    };
    {
        let tar_result = job.result.tar_result.as_mut().unwrap();
        for gf in &mut tar_result.generic_files {
            match registry_view.as_ref().and_then(|v| v.find_file(&gf.identifier)) {
                None => gf.needs_save = true,
                Some(remote) if remote.md5 != gf.md5 => gf.needs_save = true,
                Some(remote) => {
                    // Unchanged since the last ingest: adopt the registry's
                    // identity so the storage key never changes.
                    gf.uuid = remote.uuid;
                    gf.storage_url = remote.storage_url.clone();
                    gf.stored_at = remote.stored_at;
                    gf.storage_md5 = remote.storage_md5.clone();
                    gf.needs_save = false;
                }
            }
        }
    }

    let output_dir = job.result.tar_result.as_ref().unwrap().output_dir.clone();
    let pending: Vec<usize> = job
        .result
        .tar_result
        .as_ref()
        .unwrap()
        .generic_files
        .iter()
        .enumerate()
        .filter(|(_, gf)| gf.needs_save && !gf.is_stored())
        .map(|(i, _)| i)
        .collect();

    if pending.is_empty() {
        tracing::info!(object = %object_identifier, "No files changed; no-op re-ingest");
        if job.result.fedora_result.is_none() {
            job.result.fedora_result = Some(FedoraResult::default());
        }
        job.result.succeed();
        let _ = results_tx.send(job).await;
        return;
    }

    let mut saved = 0usize;
    let mut failed = 0usize;
    let mut failures = Vec::new();

    for index in pending {
        let gf = &mut job.result.tar_result.as_mut().unwrap().generic_files[index];

        // A redelivery after a partial copy: the uuid is stable, so a
        // head on the storage key tells us this file already made it.
        // Single-part etags are MD5s; multipart etags carry a part-count
        // suffix and cannot be compared to one, so a completed multipart
        // upload is recognized by its stored size instead.
        if let Ok(Some(meta)) = ctx
            .store
            .head(&ctx.config.preservation_bucket, &gf.storage_key())
            .await
        {
            let already_stored = if gf.size < ctx.config.multipart_threshold_bytes {
                meta.etag.eq_ignore_ascii_case(&gf.md5)
            } else {
                meta.size == gf.size
            };
            if already_stored {
                let url = ctx.store.url_for(&ctx.config.preservation_bucket, &gf.storage_key());
                gf.mark_stored(&url);
                saved += 1;
                record_outcome(&mut job.result.fedora_result, gf, None);
                continue;
            }
        }

        let outcome = {
            let _hb = Heartbeat::start(job.delivery.handle());
            store_one(&ctx, &output_dir, &institution, &bag_name, gf).await
        };
        match outcome {
            Ok(url) => {
                gf.mark_stored(&url);
                saved += 1;
                record_outcome(&mut job.result.fedora_result, gf, None);
                tracing::info!(file = %gf.identifier, url = %url, "Stored");
            }
            Err(e) => {
                failed += 1;
                failures.push(format!("{}: {e}", gf.identifier));
                record_outcome(&mut job.result.fedora_result, gf, Some(&e.to_string()));
                tracing::error!(file = %gf.identifier, error = %e, "Store failed");
            }
        }
    }

    if failed > 0 {
        job.result.fail(
            Stage::Store,
            &format!(
                "Incomplete copy to preservation storage: {saved} of {} files stored, {failed} failed: {}.",
                saved + failed,
                failures.join("; ")
            ),
            true,
        );
    } else {
        job.result.succeed();
    }
    let _ = results_tx.send(job).await;
}

fn record_outcome(ledger: &mut Option<FedoraResult>, gf: &GenericFile, error: Option<&str>) {
    let ledger = ledger.get_or_insert_with(FedoraResult::default);
    match error {
        None => ledger.record_success(EntityType::File, RegistryAction::Create, &gf.identifier),
        Some(e) => ledger.record_failure(EntityType::File, RegistryAction::Create, &gf.identifier, e),
    }
}

/// Upload one file, retrying with a rewind to offset zero between
/// attempts. Big files go multipart; the usual failure this loop absorbs
/// is a connection reset partway through a multipart put.
async fn store_one(
    ctx: &ProcessContext,
    output_dir: &std::path::Path,
    institution: &str,
    bag_name: &str,
    gf: &GenericFile,
) -> anyhow::Result<String> {
    let src = output_dir.join(&gf.path);
    let opts = PutOptions::with_md5(&gf.md5)?
        .meta("md5", &gf.md5)
        .meta("sha256", &gf.sha256)
        .meta("institution", institution)
        .meta("bag", bag_name)
        .meta("bagpath", &gf.path);
    let bucket = &ctx.config.preservation_bucket;
    let key = gf.storage_key();

    let mut last_error = None;
    for attempt in 1..=ctx.config.store_retries {
        let outcome = if gf.size < ctx.config.multipart_threshold_bytes {
            ctx.store.put_file(bucket, &key, &src, &opts).await
        } else {
            ctx.store
                .put_file_multipart(bucket, &key, &src, ctx.config.multipart_part_size_bytes, &opts)
                .await
        };
        match outcome {
            Ok(_etag) => return Ok(ctx.store.url_for(bucket, &key)),
            Err(e) => {
                tracing::warn!(file = %gf.identifier, attempt, error = %e, "Upload attempt failed");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("upload failed")))
}

async fn results(ctx: Arc<ProcessContext>, cleanup_tx: mpsc::Sender<Job>, mut job: Job) {
    ctx.log_envelope(WORKER_NAME, &job.result);

    if job.result.has_errors() {
        ctx.record_failure();
    } else if let Err(e) = publish_json(ctx.broker.as_ref(), topics::RECORD, &job.result).await {
        job.result.fail(Stage::Store, &format!("Cannot enqueue for recording: {e}."), true);
        ctx.record_failure();
    } else {
        ctx.record_success();
    }
    let _ = cleanup_tx.send(job).await;
}

// The envelope keeps the stage it failed in; the trouble sink needs it.
async fn cleanup(ctx: Arc<ProcessContext>, max_attempts: u32, requeue_delay: Duration, job: Job) {
    let disposition = classify(
        job.result.has_errors(),
        job.result.retry,
        job.delivery.attempts,
        max_attempts,
        requeue_delay,
    );

    // Keep the unpacked bag (and its reservation) across a requeue so the
    // next attempt can resume; drop both on any terminal disposition.
    if !matches!(disposition, crate::pipeline::Disposition::Requeue(_)) {
        if let Some(tar_result) = &job.result.tar_result {
            let _ = tokio::fs::remove_dir_all(&tar_result.output_dir).await;
        }
        ctx.volume.release(job.result.s3_file.size);
    }

    settle(ctx.broker.as_ref(), &job.delivery, disposition, topics::TROUBLE, &job.result).await;
    ctx.unregister_item(&job.result.artifact_key());
}
