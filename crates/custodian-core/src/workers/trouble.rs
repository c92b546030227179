//! TroubleProcessor: terminal sink for exhausted envelopes.
//!
//! One instance serves whichever trouble topic it is pointed at
//! (`trouble`, `failed_fixity`, `failed_replication`, `dpn_trouble`).
//! Envelopes are written verbatim to a per-topic directory, keyed by
//! artifact, as the restart input for the `requeue` CLI.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::context::ProcessContext;
use crate::pipeline::{spawn_stage, SharedReceiver};
use crate::queue::Delivery;

pub struct TroubleProcessor;

impl TroubleProcessor {
    /// Run against one trouble topic.
    pub async fn run(ctx: Arc<ProcessContext>, topic: &str) -> anyhow::Result<()> {
        let cfg = ctx.config.worker(topic);
        let mut deliveries = ctx
            .broker
            .subscribe(topic, &cfg.channel, cfg.channel_capacity())
            .await?;

        let (work_tx, work_rx) = mpsc::channel::<Delivery>(cfg.channel_capacity());
        {
            let ctx = ctx.clone();
            let topic = topic.to_string();
            spawn_stage("trouble", cfg.workers, SharedReceiver::new(work_rx), move |delivery| {
                persist(ctx.clone(), topic.clone(), delivery)
            });
        }

        tracing::info!(topic = %topic, "TroubleProcessor started");

        while let Some(delivery) = deliveries.recv().await {
            if work_tx.send(delivery).await.is_err() {
                anyhow::bail!("trouble channel closed");
            }
        }
        Ok(())
    }

    /// Where an envelope with this artifact key lands for a given topic.
    pub fn sink_path(ctx: &ProcessContext, topic: &str, artifact_key: &str) -> PathBuf {
        let safe: String = artifact_key
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        ctx.config.log_dir.join(topic).join(format!("{safe}.json"))
    }
}

/// Best-effort artifact key from any of the pipeline's envelope shapes.
fn artifact_key(value: &serde_json::Value) -> Option<String> {
    if let Some(s3) = value.get("s3_file") {
        let bucket = s3.get("bucket")?.as_str()?;
        let key = s3.get("key")?.as_str()?;
        return Some(format!("{bucket}/{key}"));
    }
    if let (Some(bucket), Some(key)) = (value.get("bucket"), value.get("key")) {
        return Some(format!("{}/{}", bucket.as_str()?, key.as_str()?));
    }
    if let Some(transfer) = value.get("transfer") {
        return Some(transfer.get("bag")?.as_str()?.to_string());
    }
    if let Some(id) = value.get("object_identifier").and_then(|v| v.as_str()) {
        if !id.is_empty() {
            return Some(id.to_string());
        }
    }
    value
        .get("identifier")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

async fn persist(ctx: Arc<ProcessContext>, topic: String, delivery: Delivery) {
    let value: serde_json::Value = match delivery.parse() {
        Ok(value) => value,
        Err(e) => {
            tracing::error!(id = %delivery.id, error = %e, "Trouble envelope is not JSON, discarding");
            delivery.finish().await;
            return;
        }
    };

    let key = artifact_key(&value).unwrap_or_else(|| delivery.id.clone());
    let path = TroubleProcessor::sink_path(&ctx, &topic, &key);

    let written = async {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, serde_json::to_vec_pretty(&value)?).await?;
        anyhow::Ok(())
    }
    .await;

    match written {
        Ok(()) => {
            tracing::warn!(key = %key, path = %path.display(), "Envelope persisted for review");
            ctx.record_success();
        }
        Err(e) => {
            // Losing the file loses the operator's restart input; the
            // envelope log below is the fallback copy.
            tracing::error!(key = %key, error = %e, "Cannot persist trouble envelope");
            ctx.record_failure();
        }
    }
    ctx.log_envelope(&topic, &value);
    delivery.finish().await;
}
