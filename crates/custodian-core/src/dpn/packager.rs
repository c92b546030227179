//! DpnPackager: turn one of our objects into a cross-node bag.
//!
//! Outbound direction of the replication pipeline. The packaged tar joins
//! the inbound flow at the validation topic, carrying a transfer record
//! that names us as the sending node.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::bag::{pack, BagWriter};
use crate::context::ProcessContext;
use crate::digests;
use crate::error::Error;
use crate::models::{
    DpnBag, DpnReplicationTransfer, DpnResult, DpnStage, TransferStatus,
};
use crate::pipeline::{classify, settle, spawn_stage, Heartbeat, SharedReceiver};
use crate::queue::{publish_json, Delivery};
use crate::workers::topics;

use super::staging_tar;

const WORKER_NAME: &str = "dpn_package";

/// Envelope for the package topic: which object, for which peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DpnPackageRequest {
    pub object_identifier: String,
    pub to_node: String,
}

struct Job {
    delivery: Delivery,
    request: DpnPackageRequest,
}

pub struct DpnPackager;

impl DpnPackager {
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
            spawn_stage("package", cfg.workers, SharedReceiver::new(work_rx), move |job| {
                package(ctx.clone(), max_attempts, requeue_delay, job)
            });
        }

        tracing::info!(topic = %cfg.topic, workers = cfg.workers, "DpnPackager started");

        while let Some(delivery) = deliveries.recv().await {
            let request: DpnPackageRequest = match delivery.parse() {
                Ok(request) => request,
                Err(e) => {
                    tracing::error!(id = %delivery.id, error = %e, "Unreadable envelope, discarding");
                    delivery.finish().await;
                    continue;
                }
            };
            if let Err(Error::AlreadyInProgress { message_id, .. }) =
                ctx.register_item(&request.object_identifier, &delivery.id)
            {
                tracing::info!(key = %request.object_identifier, holder = %message_id, "Duplicate delivery, finishing");
                delivery.finish().await;
                continue;
            }
            if work_tx.send(Job { delivery, request }).await.is_err() {
                anyhow::bail!("package channel closed");
            }
        }
        Ok(())
    }
}

async fn package(ctx: Arc<ProcessContext>, max_attempts: u32, requeue_delay: Duration, job: Job) {
    let object_identifier = job.request.object_identifier.clone();
    let bag_uuid = Uuid::new_v4();
    let bag_dir = ctx.config.dpn.staging_dir.join(format!("{bag_uuid}_bag"));

    let outcome = build(&ctx, &job, bag_uuid, &bag_dir).await;
    let _ = tokio::fs::remove_dir_all(&bag_dir).await;

    match outcome {
        Ok(result) => {
            tracing::info!(object = %object_identifier, bag = %bag_uuid, "Object packaged");
            ctx.record_success();
            if let Err(e) = publish_json(ctx.broker.as_ref(), topics::DPN_VALIDATION, &result).await {
                tracing::error!(error = %e, "Cannot enqueue packaged bag");
                ctx.record_failure();
                job.delivery.requeue(requeue_delay).await;
            } else {
                job.delivery.finish().await;
            }
        }
        Err(e) => {
            ctx.record_failure();
            tracing::error!(object = %object_identifier, error = %e, "Packaging failed");
            ctx.log_envelope(WORKER_NAME, &serde_json::json!({
                "object_identifier": object_identifier,
                "to_node": job.request.to_node,
                "error": e.to_string(),
            }));
            let disposition = classify(true, true, job.delivery.attempts, max_attempts, requeue_delay);
            settle(ctx.broker.as_ref(), &job.delivery, disposition, topics::DPN_TROUBLE, &job.request)
                .await;
        }
    }
    ctx.unregister_item(&object_identifier);
}

async fn build(
    ctx: &ProcessContext,
    job: &Job,
    bag_uuid: Uuid,
    bag_dir: &std::path::Path,
) -> anyhow::Result<DpnResult> {
    let object_identifier = &job.request.object_identifier;
    let object = ctx
        .registry
        .get_object(object_identifier, true)
        .await?
        .ok_or_else(|| anyhow::anyhow!("registry has no object {object_identifier}"))?;

    tokio::fs::create_dir_all(bag_dir).await?;
    let mut writer = BagWriter::new(bag_dir);
    writer.add_tag("Source-Organization", &object.institution);
    writer.add_tag("Local-Id", object_identifier);
    writer.add_tag("Ingest-Node", &ctx.config.dpn.local_node);
    writer.add_tag("Bag-Type", "data");

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
    writer.finish().await?;

    let tar = staging_tar(&ctx.config.dpn, &bag_uuid);
    if let Some(parent) = tar.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    {
        let _hb = Heartbeat::start(job.delivery.handle());
        pack(bag_dir, &tar, &bag_uuid.to_string()).await?;
    }
    let digest = digests::sha256_file(&tar).await?;
    let size = tokio::fs::metadata(&tar).await?.len();

    let now = Utc::now();
    let bag = DpnBag {
        uuid: bag_uuid,
        local_id: object_identifier.clone(),
        admin_node: ctx.config.dpn.local_node.clone(),
        size,
        fixities: HashMap::from([("sha256".to_string(), digest.clone())]),
        member: object.institution.clone(),
        created_at: now,
        updated_at: now,
    };
    let transfer = DpnReplicationTransfer {
        replication_id: Uuid::new_v4(),
        from_node: ctx.config.dpn.local_node.clone(),
        to_node: job.request.to_node.clone(),
        bag: bag_uuid,
        status: TransferStatus::Requested,
        link: tar.display().to_string(),
        fixity_value: digest,
        fixity_nonce: None,
        fixity_accept: None,
        protocol: "rsync".to_string(),
        created_at: now,
        updated_at: now,
    };

    let mut result = DpnResult::new(transfer);
    result.bag = Some(bag);
    result.stage = DpnStage::Package;
    result.staging_path = Some(tar);
    Ok(result)
}
