//! DpnCopier: pull a peer's bag tar onto the local staging volume.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::context::ProcessContext;
use crate::error::Error;
use crate::models::{DpnResult, DpnStage};
use crate::pipeline::{classify, settle, spawn_stage, Heartbeat, SharedReceiver};
use crate::queue::{publish_json, Delivery};
use crate::workers::topics;

use super::{staging_tar, NodeClients};

const WORKER_NAME: &str = "dpn_copy";

struct Job {
    delivery: Delivery,
    result: DpnResult,
}

pub struct DpnCopier;

impl DpnCopier {
    pub async fn run(ctx: Arc<ProcessContext>, nodes: Arc<NodeClients>) -> anyhow::Result<()> {
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
            spawn_stage("copy", cfg.workers, SharedReceiver::new(work_rx), move |job| {
                copy(ctx.clone(), nodes.clone(), max_attempts, requeue_delay, job)
            });
        }

        tracing::info!(topic = %cfg.topic, workers = cfg.workers, "DpnCopier started");

        while let Some(delivery) = deliveries.recv().await {
            let result: DpnResult = match delivery.parse() {
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
            if work_tx.send(Job { delivery, result }).await.is_err() {
                anyhow::bail!("copy channel closed");
            }
        }
        Ok(())
    }
}

async fn copy(
    ctx: Arc<ProcessContext>,
    nodes: Arc<NodeClients>,
    max_attempts: u32,
    requeue_delay: Duration,
    mut job: Job,
) {
    job.result.stage = DpnStage::Copy;
    let bag_uuid = job.result.transfer.bag;
    let dest = staging_tar(&ctx.config.dpn, &bag_uuid);

    let outcome = async {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // The transfer link names the source; long copies heartbeat so the
        // broker does not redeliver a half-copied bag.
        let link = job.result.transfer.link.clone();
        let src = link.strip_prefix("file://").unwrap_or(&link);
        {
            let _hb = Heartbeat::start(job.delivery.handle());
            tokio::fs::copy(src, &dest)
                .await
                .map_err(|e| anyhow::anyhow!("cannot copy {link}: {e}"))?;
        }

        // Attach the bag record from the admin node if the envelope came
        // in without one.
        if job.result.bag.is_none() {
            let from_node = nodes.get(&job.result.transfer.from_node)?;
            job.result.bag = from_node.get_bag(bag_uuid).await?;
        }
        anyhow::Ok(())
    }
    .await;

    match outcome {
        Ok(()) => {
            job.result.staging_path = Some(dest);
            tracing::info!(bag = %bag_uuid, "Bag copied to staging");
            if let Err(e) = publish_json(ctx.broker.as_ref(), topics::DPN_VALIDATION, &job.result).await
            {
                job.result.fail(&format!("Cannot enqueue for validation: {e}."), true);
            }
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&dest).await;
            job.result.fail(&format!("Copy failed: {e}."), true);
        }
    }

    super::log_result(&ctx, WORKER_NAME, &job.result);
    if job.result.has_errors() {
        ctx.record_failure();
    } else {
        ctx.record_success();
    }
    let disposition = classify(
        job.result.has_errors(),
        job.result.retry,
        job.delivery.attempts,
        max_attempts,
        requeue_delay,
    );
    settle(ctx.broker.as_ref(), &job.delivery, disposition, topics::DPN_TROUBLE, &job.result).await;
    ctx.unregister_item(&bag_uuid.to_string());
}
