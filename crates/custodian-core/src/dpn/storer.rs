//! DpnStorer: put a validated bag tar into cross-node preservation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::context::ProcessContext;
use crate::error::Error;
use crate::models::{DpnResult, DpnStage};
use crate::pipeline::{classify, settle, spawn_stage, Heartbeat, SharedReceiver};
use crate::queue::{publish_json, Delivery};
use crate::store::PutOptions;
use crate::workers::topics;

use super::outbound_tar;

const WORKER_NAME: &str = "dpn_store";

struct Job {
    delivery: Delivery,
    result: DpnResult,
}

pub struct DpnStorer;

impl DpnStorer {
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
            spawn_stage("store", cfg.workers, SharedReceiver::new(work_rx), move |job| {
                store(ctx.clone(), max_attempts, requeue_delay, job)
            });
        }

        tracing::info!(topic = %cfg.topic, workers = cfg.workers, "DpnStorer started");

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
                anyhow::bail!("dpn store channel closed");
            }
        }
        Ok(())
    }
}

async fn store(ctx: Arc<ProcessContext>, max_attempts: u32, requeue_delay: Duration, mut job: Job) {
    job.result.stage = DpnStage::Store;
    let bag_uuid = job.result.transfer.bag;
    let local_node = &ctx.config.dpn.local_node;

    let outcome = async {
        let tar = job
            .result
            .staging_path
            .clone()
            .ok_or_else(|| anyhow::anyhow!("envelope has no staged tar"))?;
        let digest = &job.result.validation_digest;
        if digest.is_empty() {
            anyhow::bail!("envelope was not validated");
        }

        let bucket = &ctx.config.preservation_bucket;
        let key = format!("{}{bag_uuid}.tar", ctx.config.dpn.preservation_prefix);
        let opts = PutOptions::default()
            .meta("sha256", digest)
            .meta("bag", &bag_uuid.to_string())
            .meta("from_node", &job.result.transfer.from_node);

        let size = tokio::fs::metadata(&tar).await?.len();
        let mut last_error = None;
        let mut stored = false;
        for attempt in 1..=ctx.config.store_retries {
            let put = {
                let _hb = Heartbeat::start(job.delivery.handle());
                if size < ctx.config.multipart_threshold_bytes {
                    ctx.store.put_file(bucket, &key, &tar, &opts).await
                } else {
                    ctx.store
                        .put_file_multipart(
                            bucket,
                            &key,
                            &tar,
                            ctx.config.multipart_part_size_bytes,
                            &opts,
                        )
                        .await
                }
            };
            match put {
                Ok(_etag) => {
                    stored = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!(bag = %bag_uuid, attempt, error = %e, "Upload attempt failed");
                    last_error = Some(e);
                }
            }
        }
        if !stored {
            return Err(last_error.unwrap_or_else(|| anyhow::anyhow!("upload failed")));
        }
        job.result.storage_url = ctx.store.url_for(bucket, &key);

        // An outbound bag additionally lands in the pickup directory the
        // receiving node pulls from.
        if job.result.transfer.from_node == *local_node
            && job.result.transfer.to_node != *local_node
        {
            let pickup = outbound_tar(&ctx.config.dpn, &job.result.transfer.to_node, &bag_uuid);
            if let Some(parent) = pickup.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(&tar, &pickup).await?;
        }

        // The staged tar has served its purpose.
        let _ = tokio::fs::remove_file(&tar).await;
        anyhow::Ok(())
    }
    .await;

    match outcome {
        Ok(()) => {
            tracing::info!(bag = %bag_uuid, url = %job.result.storage_url, "Bag stored");
            if let Err(e) = publish_json(ctx.broker.as_ref(), topics::DPN_RECORD, &job.result).await {
                job.result.fail(&format!("Cannot enqueue for recording: {e}."), true);
            }
        }
        Err(e) => job.result.fail(&format!("Store failed: {e}."), true),
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
