//! Replicator: second-copy every preserved file.
//!
//! A server-side copy from the preservation bucket to the replication
//! bucket under the same storage key. No bytes touch local disk.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::context::ProcessContext;
use crate::error::Error;
use crate::models::{GenericFile, PremisEvent};
use crate::pipeline::{classify, settle, spawn_stage, Disposition, SharedReceiver};
use crate::queue::Delivery;
use crate::registry::EventSubject;

use super::topics;

const WORKER_NAME: &str = "replication";

struct Job {
    delivery: Delivery,
    file: GenericFile,
}

pub struct Replicator;

impl Replicator {
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
            spawn_stage("replicate", cfg.workers, SharedReceiver::new(work_rx), move |job| {
                replicate(ctx.clone(), max_attempts, requeue_delay, job)
            });
        }

        tracing::info!(topic = %cfg.topic, workers = cfg.workers, "Replicator started");

        while let Some(delivery) = deliveries.recv().await {
            let file: GenericFile = match delivery.parse() {
                Ok(file) => file,
                Err(e) => {
                    tracing::error!(id = %delivery.id, error = %e, "Unreadable envelope, discarding");
                    delivery.finish().await;
                    continue;
                }
            };
            let key = file.uuid.to_string();
            if let Err(Error::AlreadyInProgress { message_id, .. }) =
                ctx.register_item(&key, &delivery.id)
            {
                tracing::info!(key = %key, holder = %message_id, "Duplicate delivery, finishing");
                delivery.finish().await;
                continue;
            }
            if work_tx.send(Job { delivery, file }).await.is_err() {
                anyhow::bail!("replication channel closed");
            }
        }
        Ok(())
    }
}

/// `institution/bag` prefix of a file identifier.
fn object_identifier_of(file_identifier: &str) -> String {
    file_identifier.splitn(3, '/').take(2).collect::<Vec<_>>().join("/")
}

async fn replicate(ctx: Arc<ProcessContext>, max_attempts: u32, requeue_delay: Duration, mut job: Job) {
    let key = job.file.storage_key();

    let outcome = async {
        ctx.store
            .copy_object(
                &ctx.config.preservation_bucket,
                &key,
                &ctx.config.replication_bucket,
                &key,
            )
            .await?;

        job.file.replicated_at = Some(Utc::now());
        let object_identifier = object_identifier_of(&job.file.identifier);
        ctx.registry.save_file(&object_identifier, &job.file).await?;

        let url = ctx.store.url_for(&ctx.config.replication_bucket, &key);
        let event = PremisEvent::replication(&url);
        ctx.registry
            .save_event(EventSubject::File(&job.file.identifier), &event)
            .await?;
        anyhow::Ok(())
    }
    .await;

    let disposition = match outcome {
        Ok(()) => {
            tracing::info!(file = %job.file.identifier, "Replicated");
            ctx.record_success();
            Disposition::Finish
        }
        Err(e) => {
            tracing::error!(file = %job.file.identifier, error = %e, "Replication failed");
            ctx.record_failure();
            classify(true, true, job.delivery.attempts, max_attempts, requeue_delay)
        }
    };

    ctx.log_envelope(WORKER_NAME, &job.file);
    settle(
        ctx.broker.as_ref(),
        &job.delivery,
        disposition,
        topics::FAILED_REPLICATION,
        &job.file,
    )
    .await;
    ctx.unregister_item(&job.file.uuid.to_string());
}
