//! DpnValidator: verify a staged tar against the transfer's fixity.
//!
//! A digest mismatch is terminal: the transfer is cancelled upstream and
//! the envelope goes to the cross-node trouble topic. On a match, the
//! receipt (HMAC of the digest under the transfer's nonce, when one was
//! issued) goes back to the requesting node with status Received.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::mpsc;

use crate::context::ProcessContext;
use crate::digests;
use crate::error::Error;
use crate::models::{DpnResult, DpnStage, TransferStatus};
use crate::pipeline::{classify, settle, spawn_stage, Heartbeat, SharedReceiver};
use crate::queue::{publish_json, Delivery};
use crate::workers::topics;

use super::NodeClients;

const WORKER_NAME: &str = "dpn_validation";

struct Job {
    delivery: Delivery,
    result: DpnResult,
}

pub struct DpnValidator;

impl DpnValidator {
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
            spawn_stage("validate", cfg.workers, SharedReceiver::new(work_rx), move |job| {
                validate(ctx.clone(), nodes.clone(), max_attempts, requeue_delay, job)
            });
        }

        tracing::info!(topic = %cfg.topic, workers = cfg.workers, "DpnValidator started");

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
                anyhow::bail!("validate channel closed");
            }
        }
        Ok(())
    }
}

/// Hex HMAC-SHA256 of the digest under the transfer's nonce.
fn receipt(digest: &str, nonce: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(nonce.as_bytes()).expect("hmac accepts any key length");
    mac.update(digest.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

async fn validate(
    ctx: Arc<ProcessContext>,
    nodes: Arc<NodeClients>,
    max_attempts: u32,
    requeue_delay: Duration,
    mut job: Job,
) {
    job.result.stage = DpnStage::Validate;
    let bag_uuid = job.result.transfer.bag;
    let local_node = ctx.config.dpn.local_node.clone();

    let outcome = async {
        let tar = job
            .result
            .staging_path
            .clone()
            .ok_or_else(|| anyhow::anyhow!("envelope has no staged tar"))?;

        let digest = {
            let _hb = Heartbeat::start(job.delivery.handle());
            digests::sha256_file(&tar).await?
        };

        if !digest.eq_ignore_ascii_case(&job.result.transfer.fixity_value) {
            return Err(Error::FixityMismatch {
                subject: format!("bag {bag_uuid}"),
                expected: job.result.transfer.fixity_value.clone(),
                actual: digest,
            }
            .into());
        }
        job.result.validation_digest = digest.clone();

        // Inbound transfers answer the issuing node with a receipt; an
        // outbound bag was digested by our own packager and has no one
        // to answer to.
        if job.result.transfer.from_node != local_node {
            let from_node = nodes.get(&job.result.transfer.from_node)?;
            if let Some(nonce) = job.result.transfer.fixity_nonce.clone() {
                job.result.transfer.fixity_accept = Some(receipt(&digest, &nonce));
            }
            job.result.transfer.status = TransferStatus::Received;
            job.result.transfer.updated_at = Utc::now();
            job.result.transfer = from_node.update_transfer(&job.result.transfer).await?;
        }
        anyhow::Ok(())
    }
    .await;

    match outcome {
        Ok(()) => {
            tracing::info!(bag = %bag_uuid, "Bag fixity verified");
            if let Err(e) = publish_json(ctx.broker.as_ref(), topics::DPN_STORE, &job.result).await {
                job.result.fail(&format!("Cannot enqueue for storage: {e}."), true);
            }
        }
        Err(e) => {
            let transient = e
                .downcast_ref::<Error>()
                .map(Error::is_transient)
                .unwrap_or(true);
            job.result.fail(&format!("Validation failed: {e}."), transient);
            if !transient {
                // Bad bytes: cancel upstream and drop the staged tar.
                cancel_transfer(&nodes, &mut job.result, &local_node).await;
                if let Some(tar) = &job.result.staging_path {
                    let _ = tokio::fs::remove_file(tar).await;
                }
            }
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

async fn cancel_transfer(nodes: &NodeClients, result: &mut DpnResult, local_node: &str) {
    if result.transfer.from_node == local_node {
        return;
    }
    result.transfer.status = TransferStatus::Cancelled;
    result.transfer.updated_at = Utc::now();
    match nodes.get(&result.transfer.from_node) {
        Ok(from_node) => {
            if let Err(e) = from_node.update_transfer(&result.transfer).await {
                tracing::error!(bag = %result.transfer.bag, error = %e, "Cannot cancel transfer upstream");
            }
        }
        Err(e) => {
            tracing::error!(bag = %result.transfer.bag, error = %e, "No client to cancel transfer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receipt_is_stable_and_nonce_sensitive() {
        let digest = "c0ffee";
        let a = receipt(digest, "nonce-1");
        let b = receipt(digest, "nonce-1");
        let c = receipt(digest, "nonce-2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
