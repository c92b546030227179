//! BagDeleter and FileDeleter: remove stored objects on request.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::context::ProcessContext;
use crate::error::Error;
use crate::models::{CleanupResult, PremisEvent, ProcessStatus, Stage, Status};
use crate::pipeline::{classify, settle, spawn_stage, Disposition, SharedReceiver};
use crate::queue::Delivery;
use crate::registry::EventSubject;

use super::topics;

/// Deletes every key a bag-delete request lists, then resolves the
/// work-log row. Targets are preservation/replication keys collected by
/// the operator tooling.
pub struct BagDeleter;

impl BagDeleter {
    pub async fn run(ctx: Arc<ProcessContext>) -> anyhow::Result<()> {
        let cfg = ctx.config.worker("bag_delete");
        let mut deliveries = ctx
            .broker
            .subscribe(&cfg.topic, &cfg.channel, cfg.channel_capacity())
            .await?;

        let (work_tx, work_rx) = mpsc::channel(cfg.channel_capacity());
        {
            let ctx = ctx.clone();
            let max_attempts = cfg.max_attempts;
            let requeue_delay = Duration::from_secs(cfg.requeue_delay_secs);
            spawn_stage("bag_delete", cfg.workers, SharedReceiver::new(work_rx), move |job| {
                delete_bag(ctx.clone(), max_attempts, requeue_delay, job)
            });
        }

        tracing::info!(topic = %cfg.topic, workers = cfg.workers, "BagDeleter started");

        while let Some(delivery) = deliveries.recv().await {
            let result: CleanupResult = match delivery.parse() {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(id = %delivery.id, error = %e, "Unreadable envelope, discarding");
                    delivery.finish().await;
                    continue;
                }
            };
            let key = format!("{}/{}", result.institution, result.bag_name);
            if let Err(Error::AlreadyInProgress { message_id, .. }) =
                ctx.register_item(&key, &delivery.id)
            {
                tracing::info!(key = %key, holder = %message_id, "Duplicate delivery, finishing");
                delivery.finish().await;
                continue;
            }
            if work_tx.send(BagJob { delivery, result }).await.is_err() {
                anyhow::bail!("bag_delete channel closed");
            }
        }
        Ok(())
    }
}

struct BagJob {
    delivery: Delivery,
    result: CleanupResult,
}

async fn delete_bag(ctx: Arc<ProcessContext>, max_attempts: u32, requeue_delay: Duration, mut job: BagJob) {
    let artifact_key = format!("{}/{}", job.result.institution, job.result.bag_name);

    let mut had_error = false;
    for file in &mut job.result.files {
        if file.deleted_at.is_some() {
            continue;
        }
        match ctx.store.delete(&file.bucket, &file.key).await {
            Ok(()) => file.deleted_at = Some(Utc::now()),
            Err(e) => {
                had_error = true;
                file.error_message = format!("Cannot delete {}/{}: {e}.", file.bucket, file.key);
            }
        }
    }

    if !had_error {
        match ctx
            .registry
            .get_status(&job.result.etag, &format!("{}.tar", job.result.bag_name), job.result.bag_date)
            .await
        {
            Ok(Some(mut status)) => {
                status.transition(Stage::Resolve, Status::Success, "Bag deleted from storage");
                status.retry = false;
                if ctx.registry.save_status(&status).await.is_err() {
                    had_error = true;
                }
            }
            Ok(None) => {}
            Err(_) => had_error = true,
        }
    }

    if had_error {
        ctx.record_failure();
    } else {
        ctx.record_success();
    }
    ctx.log_envelope("bag_delete", &job.result);

    let disposition = classify(had_error, true, job.delivery.attempts, max_attempts, requeue_delay);
    settle(ctx.broker.as_ref(), &job.delivery, disposition, topics::TROUBLE, &job.result).await;
    ctx.unregister_item(&artifact_key);
}

/// Deletes one generic file from both storage buckets, stamps the
/// registry record, and writes the deletion event.
pub struct FileDeleter;

impl FileDeleter {
    pub async fn run(ctx: Arc<ProcessContext>) -> anyhow::Result<()> {
        let cfg = ctx.config.worker("file_delete");
        let mut deliveries = ctx
            .broker
            .subscribe(&cfg.topic, &cfg.channel, cfg.channel_capacity())
            .await?;

        let (work_tx, work_rx) = mpsc::channel(cfg.channel_capacity());
        {
            let ctx = ctx.clone();
            let max_attempts = cfg.max_attempts;
            let requeue_delay = Duration::from_secs(cfg.requeue_delay_secs);
            spawn_stage("file_delete", cfg.workers, SharedReceiver::new(work_rx), move |job| {
                delete_file(ctx.clone(), max_attempts, requeue_delay, job)
            });
        }

        tracing::info!(topic = %cfg.topic, workers = cfg.workers, "FileDeleter started");

        while let Some(delivery) = deliveries.recv().await {
            let status: ProcessStatus = match delivery.parse() {
                Ok(status) => status,
                Err(e) => {
                    tracing::error!(id = %delivery.id, error = %e, "Unreadable envelope, discarding");
                    delivery.finish().await;
                    continue;
                }
            };
            if status.generic_file_identifier.is_empty() {
                tracing::error!(id = %delivery.id, "File-delete request names no file");
                delivery.finish().await;
                continue;
            }
            if let Err(Error::AlreadyInProgress { message_id, .. }) =
                ctx.register_item(&status.generic_file_identifier, &delivery.id)
            {
                tracing::info!(key = %status.generic_file_identifier, holder = %message_id, "Duplicate delivery, finishing");
                delivery.finish().await;
                continue;
            }
            if work_tx.send(FileJob { delivery, status }).await.is_err() {
                anyhow::bail!("file_delete channel closed");
            }
        }
        Ok(())
    }
}

struct FileJob {
    delivery: Delivery,
    status: ProcessStatus,
}

async fn delete_file(ctx: Arc<ProcessContext>, max_attempts: u32, requeue_delay: Duration, mut job: FileJob) {
    let file_identifier = job.status.generic_file_identifier.clone();
    let object_identifier = job.status.object_identifier.clone();

    let outcome = async {
        let object = ctx
            .registry
            .get_object(&object_identifier, true)
            .await?
            .ok_or_else(|| anyhow::anyhow!("registry has no object {object_identifier}"))?;
        let mut gf = object
            .find_file(&file_identifier)
            .ok_or_else(|| anyhow::anyhow!("object has no file {file_identifier}"))?
            .clone();

        let key = gf.storage_key();
        ctx.store.delete(&ctx.config.preservation_bucket, &key).await?;
        ctx.store.delete(&ctx.config.replication_bucket, &key).await?;

        gf.deleted_at = Some(Utc::now());
        ctx.registry.save_file(&object_identifier, &gf).await?;

        let event = PremisEvent::deletion(&key, &job.status.institution);
        ctx.registry
            .save_event(EventSubject::File(&file_identifier), &event)
            .await?;

        job.status.transition(Stage::Resolve, Status::Success, "File deleted from storage");
        job.status.retry = false;
        ctx.registry.save_status(&job.status).await?;
        anyhow::Ok(())
    }
    .await;

    let disposition = match outcome {
        Ok(()) => {
            tracing::info!(file = %file_identifier, "File deleted");
            ctx.record_success();
            Disposition::Finish
        }
        Err(e) => {
            tracing::error!(file = %file_identifier, error = %e, "File delete failed");
            ctx.record_failure();
            classify(true, true, job.delivery.attempts, max_attempts, requeue_delay)
        }
    };

    ctx.log_envelope("file_delete", &job.status);
    settle(ctx.broker.as_ref(), &job.delivery, disposition, topics::TROUBLE, &job.status).await;
    ctx.unregister_item(&file_identifier);
}
