//! FixityChecker: scheduled re-verification of stored digests.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::context::ProcessContext;
use crate::digests;
use crate::error::Error;
use crate::models::{GenericFile, PremisEvent};
use crate::pipeline::{classify, settle, spawn_stage, Disposition, Heartbeat, SharedReceiver};
use crate::queue::Delivery;
use crate::registry::EventSubject;

use super::{topics, RESOURCE_RETRY_DELAY};

const WORKER_NAME: &str = "fixity";

struct Job {
    delivery: Delivery,
    file: GenericFile,
}

pub struct FixityChecker;

impl FixityChecker {
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
            spawn_stage("fixity", cfg.workers, SharedReceiver::new(work_rx), move |job| {
                check(ctx.clone(), max_attempts, requeue_delay, job)
            });
        }

        tracing::info!(topic = %cfg.topic, workers = cfg.workers, "FixityChecker started");

        while let Some(delivery) = deliveries.recv().await {
            let file: GenericFile = match delivery.parse() {
                Ok(file) => file,
                Err(e) => {
                    tracing::error!(id = %delivery.id, error = %e, "Unreadable envelope, discarding");
                    delivery.finish().await;
                    continue;
                }
            };
            if let Err(Error::AlreadyInProgress { message_id, .. }) =
                ctx.register_item(&file.identifier, &delivery.id)
            {
                tracing::info!(key = %file.identifier, holder = %message_id, "Duplicate delivery, finishing");
                delivery.finish().await;
                continue;
            }
            if work_tx.send(Job { delivery, file }).await.is_err() {
                anyhow::bail!("fixity channel closed");
            }
        }
        Ok(())
    }
}

async fn check(ctx: Arc<ProcessContext>, max_attempts: u32, requeue_delay: Duration, job: Job) {
    let gf = &job.file;

    if let Err(e) = ctx.volume.reserve(gf.size) {
        tracing::info!(file = %gf.identifier, error = %e, "No staging space, requeueing");
        ctx.unregister_item(&gf.identifier);
        job.delivery.requeue(RESOURCE_RETRY_DELAY).await;
        return;
    }

    let scratch = ctx.config.staging_dir.join(format!("fixity_{}", gf.uuid));
    let checked = download_and_digest(&ctx, &job, &scratch).await;
    let _ = tokio::fs::remove_file(&scratch).await;
    ctx.volume.release(gf.size);

    let disposition = match checked {
        Err(e) => {
            // Download or registry trouble, not evidence of corruption.
            tracing::error!(file = %gf.identifier, error = %e, "Fixity check could not run");
            ctx.record_failure();
            classify(true, true, job.delivery.attempts, max_attempts, requeue_delay)
        }
        Ok(actual) => {
            let matched = actual.eq_ignore_ascii_case(&gf.sha256);
            let event = PremisEvent::fixity_check(matched, &gf.sha256, &actual);
            if let Err(e) = ctx
                .registry
                .save_event(EventSubject::File(&gf.identifier), &event)
                .await
            {
                tracing::error!(file = %gf.identifier, error = %e, "Cannot record fixity event");
                ctx.record_failure();
                classify(true, true, job.delivery.attempts, max_attempts, requeue_delay)
            } else if matched {
                tracing::info!(file = %gf.identifier, "Fixity confirmed");
                ctx.record_success();
                Disposition::Finish
            } else {
                tracing::error!(
                    file = %gf.identifier,
                    expected = %gf.sha256,
                    actual = %actual,
                    "Fixity mismatch"
                );
                ctx.record_failure();
                Disposition::Trouble
            }
        }
    };

    ctx.log_envelope(WORKER_NAME, &job.file);
    settle(ctx.broker.as_ref(), &job.delivery, disposition, topics::FAILED_FIXITY, &job.file).await;
    ctx.unregister_item(&gf.identifier);
}

async fn download_and_digest(
    ctx: &ProcessContext,
    job: &Job,
    scratch: &std::path::Path,
) -> anyhow::Result<String> {
    let _hb = Heartbeat::start(job.delivery.handle());
    ctx.store
        .get_to_file(&ctx.config.preservation_bucket, &job.file.storage_key(), scratch)
        .await?;
    digests::sha256_file(scratch).await
}
