//! CleanupWorker: delete ingested tars from receiving buckets.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::context::ProcessContext;
use crate::error::Error;
use crate::models::{CleanupResult, Stage, Status};
use crate::pipeline::{classify, settle, spawn_stage, SharedReceiver};
use crate::queue::Delivery;

use super::topics;

const WORKER_NAME: &str = "cleanup";

struct Job {
    delivery: Delivery,
    result: CleanupResult,
}

pub struct CleanupWorker;

impl CleanupWorker {
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
            let requeue_delay = Duration::from_secs(cfg.requeue_delay_secs);
            spawn_stage("cleanup", cfg.workers, SharedReceiver::new(work_rx), move |job| {
                clean(ctx.clone(), max_attempts, requeue_delay, job)
            });
        }

        tracing::info!(topic = %cfg.topic, workers = cfg.workers, "CleanupWorker started");

        while let Some(delivery) = deliveries.recv().await {
            let result: CleanupResult = match delivery.parse() {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(id = %delivery.id, error = %e, "Unreadable envelope, discarding");
                    delivery.finish().await;
                    continue;
                }
            };
            let key = match result.files.first() {
                Some(file) => format!("{}/{}", file.bucket, file.key),
                None => {
                    tracing::warn!(id = %delivery.id, "Cleanup envelope lists no files");
                    delivery.finish().await;
                    continue;
                }
            };
            if let Err(Error::AlreadyInProgress { message_id, .. }) =
                ctx.register_item(&key, &delivery.id)
            {
                tracing::info!(key = %key, holder = %message_id, "Duplicate delivery, finishing");
                delivery.finish().await;
                continue;
            }
            if work_tx.send(Job { delivery, result }).await.is_err() {
                anyhow::bail!("cleanup channel closed");
            }
        }
        Ok(())
    }
}

async fn clean(ctx: Arc<ProcessContext>, max_attempts: u32, requeue_delay: Duration, mut job: Job) {
    let artifact_key = job
        .result
        .files
        .first()
        .map(|f| format!("{}/{}", f.bucket, f.key))
        .unwrap_or_default();

    let mut had_error = false;
    for file in &mut job.result.files {
        if file.deleted_at.is_some() {
            continue;
        }
        match ctx.store.delete(&file.bucket, &file.key).await {
            Ok(()) => {
                file.deleted_at = Some(Utc::now());
                tracing::info!(bucket = %file.bucket, key = %file.key, "Deleted from receiving bucket");
            }
            Err(e) => {
                had_error = true;
                file.error_message = format!("Cannot delete {}/{}: {e}.", file.bucket, file.key);
                tracing::error!(bucket = %file.bucket, key = %file.key, error = %e, "Delete failed");
            }
        }
    }

    // Close out the work-log row once the receiving bucket is clean.
    if !had_error {
        match ctx
            .registry
            .get_status(&job.result.etag, &format!("{}.tar", job.result.bag_name), job.result.bag_date)
            .await
        {
            Ok(Some(mut status)) => {
                status.transition(Stage::Cleanup, Status::Success, "Bag deleted from receiving bucket");
                status.retry = false;
                if let Err(e) = ctx.registry.save_status(&status).await {
                    had_error = true;
                    tracing::error!(error = %e, "Cannot update work-log row");
                }
            }
            Ok(None) => {
                tracing::warn!(bag = %job.result.bag_name, "No work-log row to resolve");
            }
            Err(e) => {
                had_error = true;
                tracing::error!(error = %e, "Cannot load work-log row");
            }
        }
    }

    if had_error {
        ctx.record_failure();
    } else {
        ctx.record_success();
    }
    ctx.log_envelope(WORKER_NAME, &job.result);

    // Deletion failures are transient: the bucket is still there, the
    // grant may not be.
    let disposition = classify(had_error, true, job.delivery.attempts, max_attempts, requeue_delay);
    settle(ctx.broker.as_ref(), &job.delivery, disposition, topics::TROUBLE, &job.result).await;
    ctx.unregister_item(&artifact_key);
}
