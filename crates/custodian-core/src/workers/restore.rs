//! BagRestorer: rebuild a bag from preservation storage and upload it to
//! the institution's restoration bucket.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::bag::{pack, BagWriter};
use crate::context::ProcessContext;
use crate::error::Error;
use crate::models::{ProcessStatus, Stage, Status};
use crate::pipeline::{classify, settle, spawn_stage, Heartbeat, SharedReceiver};
use crate::queue::Delivery;
use crate::store::PutOptions;

use super::{topics, RESOURCE_RETRY_DELAY};

const WORKER_NAME: &str = "restore";

struct Job {
    delivery: Delivery,
    status: ProcessStatus,
}

pub struct BagRestorer;

impl BagRestorer {
    pub async fn run(ctx: Arc<ProcessContext>) -> anyhow::Result<()> {
        let cfg = ctx.config.worker(WORKER_NAME);
        let mut deliveries = ctx
            .broker
            .subscribe(&cfg.topic, &cfg.channel, cfg.channel_capacity())
            .await?;

        let (work_tx, work_rx) = mpsc::channel::<Job>(cfg.channel_capacity());
        {
            let ctx = ctx.clone();
            let max_attempts = cfg.max_attempts;
            spawn_stage("restore", cfg.workers, SharedReceiver::new(work_rx), move |job| {
                restore(ctx.clone(), max_attempts, job)
            });
        }

        tracing::info!(topic = %cfg.topic, workers = cfg.workers, "BagRestorer started");

        while let Some(delivery) = deliveries.recv().await {
            let status: ProcessStatus = match delivery.parse() {
                Ok(status) => status,
                Err(e) => {
                    tracing::error!(id = %delivery.id, error = %e, "Unreadable envelope, discarding");
                    delivery.finish().await;
                    continue;
                }
            };
            if status.object_identifier.is_empty() {
                tracing::error!(id = %delivery.id, "Restore request names no object");
                delivery.finish().await;
                continue;
            }
            if let Err(Error::AlreadyInProgress { message_id, .. }) =
                ctx.register_item(&status.object_identifier, &delivery.id)
            {
                tracing::info!(key = %status.object_identifier, holder = %message_id, "Duplicate delivery, finishing");
                delivery.finish().await;
                continue;
            }
            if work_tx.send(Job { delivery, status }).await.is_err() {
                anyhow::bail!("restore channel closed");
            }
        }
        Ok(())
    }
}

async fn restore(ctx: Arc<ProcessContext>, max_attempts: u32, job: Job) {
    let object_identifier = job.status.object_identifier.clone();
    let mut reserved = 0u64;

    let outcome = run_restore(&ctx, &job, &mut reserved).await;

    // Leave nothing on the restore volume either way; a partial bag on
    // disk would just confuse the next attempt.
    let bag_name = object_identifier.split('/').next_back().unwrap_or(&object_identifier);
    let bag_dir = ctx.config.restore_dir.join(bag_name);
    let tar = ctx.config.restore_dir.join(format!("{bag_name}.tar"));
    let _ = tokio::fs::remove_dir_all(&bag_dir).await;
    let _ = tokio::fs::remove_file(&tar).await;
    ctx.restore_volume.release(reserved);

    match outcome {
        Ok(RestoreOutcome::Done) => {
            ctx.record_success();
            job.delivery.finish().await;
        }
        Ok(RestoreOutcome::NoSpace) => {
            job.delivery.requeue(RESOURCE_RETRY_DELAY).await;
        }
        Err(e) => {
            ctx.record_failure();
            tracing::error!(object = %object_identifier, error = %e, "Restore failed");
            ctx.log_envelope(WORKER_NAME, &serde_json::json!({
                "object_identifier": object_identifier,
                "error": e.to_string(),
            }));
            // Always retriable: the stored files are still there.
            let disposition = classify(
                true,
                true,
                job.delivery.attempts,
                max_attempts,
                Duration::from_secs(60),
            );
            settle(ctx.broker.as_ref(), &job.delivery, disposition, topics::TROUBLE, &job.status)
                .await;
        }
    }
    ctx.unregister_item(&object_identifier);
}

enum RestoreOutcome {
    Done,
    NoSpace,
}

async fn run_restore(
    ctx: &ProcessContext,
    job: &Job,
    reserved: &mut u64,
) -> anyhow::Result<RestoreOutcome> {
    let object_identifier = &job.status.object_identifier;
    let object = ctx
        .registry
        .get_object(object_identifier, true)
        .await?
        .ok_or_else(|| anyhow::anyhow!("registry has no object {object_identifier}"))?;

    // Tar plus rebuilt bag directory.
    let needed = 2 * object.total_file_size();
    if let Err(e) = ctx.restore_volume.reserve(needed) {
        tracing::info!(object = %object_identifier, error = %e, "No restore space, requeueing");
        return Ok(RestoreOutcome::NoSpace);
    }
    *reserved = needed;

    let bag_dir = ctx.config.restore_dir.join(&object.bag_name);
    tokio::fs::create_dir_all(&bag_dir).await?;
    let mut writer = BagWriter::new(&bag_dir);
    writer.add_tag("Source-Organization", &object.institution);
    writer.add_tag("Title", &object.title);
    if !object.description.is_empty() {
        writer.add_tag("Internal-Sender-Description", &object.description);
    }

    for gf in &object.files {
        if gf.deleted_at.is_some() {
            continue;
        }
        let dest = writer.payload_path(&gf.path).await?;
        let _hb = Heartbeat::start(job.delivery.handle());
        ctx.store
            .get_to_file(&ctx.config.preservation_bucket, &gf.storage_key(), &dest)
            .await?;
    }
    {
        let _hb = Heartbeat::start(job.delivery.handle());
        writer.finish().await?;
    }

    let tar = ctx.config.restore_dir.join(format!("{}.tar", object.bag_name));
    let tar_key = format!("{}.tar", object.bag_name);
    {
        let _hb = Heartbeat::start(job.delivery.handle());
        pack(&bag_dir, &tar, &object.bag_name).await?;
    }

    let bucket = ctx.config.restoration_bucket(&object.institution);
    let size = tokio::fs::metadata(&tar).await?.len();
    {
        let _hb = Heartbeat::start(job.delivery.handle());
        if size < ctx.config.multipart_threshold_bytes {
            ctx.store.put_file(&bucket, &tar_key, &tar, &PutOptions::default()).await?;
        } else {
            ctx.store
                .put_file_multipart(
                    &bucket,
                    &tar_key,
                    &tar,
                    ctx.config.multipart_part_size_bytes,
                    &PutOptions::default(),
                )
                .await?;
        }
    }
    tracing::info!(object = %object_identifier, bucket = %bucket, key = %tar_key, "Bag restored");

    // Resolve every work-log row for this object.
    for mut status in ctx.registry.statuses_for_object(object_identifier).await? {
        status.transition(Stage::Resolve, Status::Success, "Object restored");
        status.retry = false;
        ctx.registry.save_status(&status).await?;
    }

    ctx.log_envelope(WORKER_NAME, &job.status);
    Ok(RestoreOutcome::Done)
}
