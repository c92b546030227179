//! BagRecorder: register object, files, and events in the registry.
//!
//! Every call lands in the envelope's ledger; one failed call marks the
//! whole envelope retriable, and event identifiers ride along in the
//! envelope so a retried recording never duplicates an event row.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::context::ProcessContext;
use crate::error::Error;
use crate::models::{
    Action, EntityType, EventType, FedoraResult, IntellectualObject, PremisEvent, ProcessResult,
    ProcessStatus, RegistryAction, Stage, Status,
};
use crate::models::{CleanupFile, CleanupResult};
use crate::pipeline::{classify, settle, spawn_stage, SharedReceiver};
use crate::queue::{publish_json, Delivery};
use crate::registry::EventSubject;

use super::topics;

const WORKER_NAME: &str = "record";

struct Job {
    delivery: Delivery,
    result: ProcessResult,
}

pub struct BagRecorder;

impl BagRecorder {
    pub async fn run(ctx: Arc<ProcessContext>) -> anyhow::Result<()> {
        let cfg = ctx.config.worker(WORKER_NAME);
        let mut deliveries = ctx
            .broker
            .subscribe(&cfg.topic, &cfg.channel, cfg.channel_capacity())
            .await?;

        let (record_tx, record_rx) = mpsc::channel::<Job>(cfg.channel_capacity());
        let (results_tx, results_rx) = mpsc::channel::<Job>(cfg.channel_capacity());
        let (cleanup_tx, cleanup_rx) = mpsc::channel::<Job>(cfg.channel_capacity());

        {
            let ctx = ctx.clone();
            let results_tx = results_tx.clone();
            spawn_stage("record", cfg.workers, SharedReceiver::new(record_rx), move |job| {
                record(ctx.clone(), results_tx.clone(), job)
            });
        }
        {
            let ctx = ctx.clone();
            let cleanup_tx = cleanup_tx.clone();
            spawn_stage("results", cfg.workers, SharedReceiver::new(results_rx), move |job| {
                results(ctx.clone(), cleanup_tx.clone(), job)
            });
        }
        {
            let ctx = ctx.clone();
            let max_attempts = cfg.max_attempts;
            let requeue_delay = Duration::from_secs(cfg.requeue_delay_secs);
            spawn_stage("cleanup", cfg.workers, SharedReceiver::new(cleanup_rx), move |job| {
                cleanup(ctx.clone(), max_attempts, requeue_delay, job)
            });
        }

        tracing::info!(topic = %cfg.topic, workers = cfg.workers, "BagRecorder started");

        while let Some(delivery) = deliveries.recv().await {
            let result: ProcessResult = match delivery.parse() {
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
            if record_tx.send(Job { delivery, result }).await.is_err() {
                anyhow::bail!("record channel closed");
            }
        }
        Ok(())
    }
}

async fn record(ctx: Arc<ProcessContext>, results_tx: mpsc::Sender<Job>, mut job: Job) {
    job.result.advance(Stage::Record);

    let s3_file = job.result.s3_file.clone();
    let institution = s3_file.institution(&ctx.config.receiving_bucket_prefix).to_string();
    let bag_name = s3_file.bag_name().to_string();
    let object_identifier = format!("{institution}/{bag_name}");

    if job.result.tar_result.is_none() {
        job.result.fail(Stage::Record, "Envelope has no file metadata to record.", false);
        let _ = results_tx.send(job).await;
        return;
    }

    let mut ledger = job.result.fedora_result.take().unwrap_or_default();

    // 1. Create or update the object itself.
    let object = build_object(&ctx, &job.result, &institution, &bag_name);
    let existing = ctx.registry.get_object(&object_identifier, false).await;
    let object_saved = match existing {
        Ok(None) => {
            let saved = ctx.registry.create_object(&object).await;
            note(&mut ledger, EntityType::Object, RegistryAction::Create, &object_identifier, &saved);
            saved.is_ok()
        }
        Ok(Some(_)) => {
            let saved = ctx.registry.update_object(&object).await;
            note(&mut ledger, EntityType::Object, RegistryAction::Update, &object_identifier, &saved);
            saved.is_ok()
        }
        Err(e) => {
            ledger.record_failure(
                EntityType::Object,
                RegistryAction::Update,
                &object_identifier,
                &e.to_string(),
            );
            false
        }
    };

    // 2. File records, then their events. Skipped entirely if the object
    // has no registry row to hang them off.
    if object_saved {
        // Event identifiers come from the envelope; minting them here
        // would hand the registry fresh dedup keys on every retry.
        if job.result.object_events.is_empty() {
            job.result.object_events = object_events(&object);
        }
        for event in job.result.object_events.clone() {
            let saved = ctx
                .registry
                .save_event(EventSubject::Object(&object_identifier), &event)
                .await;
            note(&mut ledger, EntityType::Event, RegistryAction::Create, &event.event_type.to_string(), &saved);
        }

        let generic_files = &mut job.result.tar_result.as_mut().unwrap().generic_files;
        for gf in generic_files.iter_mut() {
            let saved = ctx.registry.save_file(&object_identifier, gf).await;
            note(&mut ledger, EntityType::File, RegistryAction::Create, &gf.identifier, &saved);
            if saved.is_err() {
                continue;
            }

            if gf.is_stored() && !gf.events.iter().any(|e| e.event_type == EventType::Ingest) {
                let ingest = PremisEvent::ingest(&gf.storage_url, &gf.md5);
                gf.add_event(ingest);
            }
            for event in gf.events.clone() {
                let saved = ctx
                    .registry
                    .save_event(EventSubject::File(&gf.identifier), &event)
                    .await;
                note(
                    &mut ledger,
                    EntityType::Event,
                    RegistryAction::Create,
                    &format!("{} {}", gf.identifier, event.event_type),
                    &saved,
                );
            }
        }
    }

    // 3. Work-log row, only once everything else held.
    if ledger.all_succeeded() {
        let status_saved = save_ingest_status(&ctx, &s3_file, &institution, &object_identifier).await;
        note(&mut ledger, EntityType::Status, RegistryAction::Update, &object_identifier, &status_saved);
    }

    if ledger.all_succeeded() {
        job.result.succeed();
    } else {
        let summary = ledger.error_summary();
        job.result.fail(Stage::Record, &summary, true);
    }
    job.result.fedora_result = Some(ledger);
    let _ = results_tx.send(job).await;
}

fn build_object(
    ctx: &ProcessContext,
    result: &ProcessResult,
    institution: &str,
    bag_name: &str,
) -> IntellectualObject {
    let tag = |label: &str| {
        result
            .bag_read_result
            .as_ref()
            .and_then(|r| r.tag_value(label))
            .unwrap_or_default()
            .to_string()
    };
    let title = match tag("Title") {
        t if t.is_empty() => bag_name.to_string(),
        t => t,
    };
    let access = match tag("Access").to_lowercase() {
        a if a.is_empty() => "institution".to_string(),
        a => a,
    };
    IntellectualObject {
        identifier: format!("{institution}/{bag_name}"),
        title,
        description: tag("Internal-Sender-Description"),
        institution: institution.to_string(),
        bag_name: bag_name.to_string(),
        access,
        alt_identifier: vec![result.s3_file.identifier()],
        files: Vec::new(),
        events: Vec::new(),
    }
}

fn object_events(object: &IntellectualObject) -> Vec<PremisEvent> {
    vec![
        PremisEvent::identifier_assignment(&object.identifier),
        PremisEvent::ingest(&object.identifier, "bag"),
    ]
}

async fn save_ingest_status(
    ctx: &ProcessContext,
    s3_file: &crate::models::S3File,
    institution: &str,
    object_identifier: &str,
) -> anyhow::Result<ProcessStatus> {
    let existing = ctx
        .registry
        .get_status(&s3_file.etag, &s3_file.key, s3_file.last_modified)
        .await?;
    let mut status = existing.unwrap_or_else(|| ProcessStatus {
        id: None,
        name: s3_file.key.clone(),
        etag: s3_file.etag.clone(),
        bag_date: s3_file.last_modified,
        institution: institution.to_string(),
        action: Action::Ingest,
        stage: Stage::Receive,
        status: Status::Pending,
        outcome: String::new(),
        retry: false,
        reviewed: false,
        note: String::new(),
        object_identifier: object_identifier.to_string(),
        generic_file_identifier: String::new(),
        date: None,
    });
    status.object_identifier = object_identifier.to_string();
    status.transition(Stage::Record, Status::Success, "Object, files, and events recorded");
    status.outcome = "Success".to_string();
    ctx.registry.save_status(&status).await
}

fn note<T>(
    ledger: &mut FedoraResult,
    entity: EntityType,
    action: RegistryAction,
    subject: &str,
    outcome: &anyhow::Result<T>,
) {
    match outcome {
        Ok(_) => ledger.record_success(entity, action, subject),
        Err(e) => ledger.record_failure(entity, action, subject, &e.to_string()),
    }
}

async fn results(ctx: Arc<ProcessContext>, cleanup_tx: mpsc::Sender<Job>, mut job: Job) {
    ctx.log_envelope(WORKER_NAME, &job.result);

    if job.result.has_errors() {
        ctx.record_failure();
        let _ = cleanup_tx.send(job).await;
        return;
    }

    // Ingest is recorded; hand the receiving-bucket tar to cleanup.
    let s3_file = &job.result.s3_file;
    let cleanup_result = CleanupResult {
        bag_name: s3_file.bag_name().to_string(),
        etag: s3_file.etag.clone(),
        bag_date: s3_file.last_modified,
        institution: s3_file
            .institution(&ctx.config.receiving_bucket_prefix)
            .to_string(),
        files: vec![CleanupFile::new(&s3_file.bucket, &s3_file.key)],
    };
    if let Err(e) = publish_json(ctx.broker.as_ref(), topics::CLEANUP, &cleanup_result).await {
        job.result.fail(Stage::Record, &format!("Cannot enqueue cleanup: {e}."), true);
        ctx.record_failure();
    } else {
        ctx.record_success();
    }
    let _ = cleanup_tx.send(job).await;
}

async fn cleanup(ctx: Arc<ProcessContext>, max_attempts: u32, requeue_delay: Duration, job: Job) {
    let disposition = classify(
        job.result.has_errors(),
        job.result.retry,
        job.delivery.attempts,
        max_attempts,
        requeue_delay,
    );
    settle(ctx.broker.as_ref(), &job.delivery, disposition, topics::TROUBLE, &job.result).await;
    ctx.unregister_item(&job.result.artifact_key());
}
