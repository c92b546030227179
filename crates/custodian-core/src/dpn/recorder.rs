//! DpnRecorder: close the loop in both registries.
//!
//! Marks the transfer Stored at the issuing node, registers the bag
//! there, and writes the ingest event into our local archival registry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::context::ProcessContext;
use crate::error::Error;
use crate::models::{DpnResult, DpnStage, PremisEvent, TransferStatus};
use crate::pipeline::{classify, settle, spawn_stage, SharedReceiver};
use crate::queue::Delivery;
use crate::registry::EventSubject;
use crate::workers::topics;

use super::NodeClients;

const WORKER_NAME: &str = "dpn_record";

struct Job {
    delivery: Delivery,
    result: DpnResult,
}

pub struct DpnRecorder;

impl DpnRecorder {
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
            spawn_stage("record", cfg.workers, SharedReceiver::new(work_rx), move |job| {
                record(ctx.clone(), nodes.clone(), max_attempts, requeue_delay, job)
            });
        }

        tracing::info!(topic = %cfg.topic, workers = cfg.workers, "DpnRecorder started");

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
                anyhow::bail!("dpn record channel closed");
            }
        }
        Ok(())
    }
}

async fn record(
    ctx: Arc<ProcessContext>,
    nodes: Arc<NodeClients>,
    max_attempts: u32,
    requeue_delay: Duration,
    mut job: Job,
) {
    job.result.stage = DpnStage::Record;
    let bag_uuid = job.result.transfer.bag;
    let local_node = ctx.config.dpn.local_node.clone();

    let outcome = async {
        if job.result.storage_url.is_empty() {
            anyhow::bail!("envelope was not stored");
        }

        // The issuing node hears that its bag reached storage; for an
        // outbound bag we are the issuing node and track it via the
        // receiver's own record updates instead.
        if job.result.transfer.from_node != local_node {
            let from_node = nodes.get(&job.result.transfer.from_node)?;
            job.result.transfer.status = TransferStatus::Stored;
            job.result.transfer.updated_at = Utc::now();
            job.result.transfer = from_node.update_transfer(&job.result.transfer).await?;

            if let Some(bag) = &mut job.result.bag {
                bag.updated_at = Utc::now();
                *bag = from_node.save_bag(bag).await?;
            }
        } else if let Some(bag) = &mut job.result.bag {
            // Outbound: announce our new bag to the receiving node.
            let to_node = nodes.get(&job.result.transfer.to_node)?;
            bag.updated_at = Utc::now();
            *bag = to_node.save_bag(bag).await?;
        }

        // Local archival registry gets the preservation event either way.
        let event = PremisEvent::ingest(&job.result.storage_url, &job.result.validation_digest);
        ctx.registry
            .save_event(EventSubject::Object(&bag_uuid.to_string()), &event)
            .await?;
        anyhow::Ok(())
    }
    .await;

    match outcome {
        Ok(()) => tracing::info!(bag = %bag_uuid, "Replication recorded"),
        Err(e) => job.result.fail(&format!("Record failed: {e}."), true),
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
