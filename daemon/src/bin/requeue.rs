//! Feed a trouble-sink file back into the pipeline.
//!
//! Reads the persisted envelope, flips `retry` on, and republishes it to
//! the named topic. This is the operator's recovery path for envelopes
//! that exhausted their attempts.

use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;

use custodian_core::queue::http::HttpBroker;
use custodian_core::queue::Broker;
use custodian_core::Config;

#[derive(Parser, Debug)]
#[command(name = "requeue")]
#[command(about = "Republish a trouble-sink envelope")]
struct Args {
    /// Topic to publish to (e.g. store, record, dpn_copy).
    topic: String,

    /// Path to the JSON file the trouble processor wrote.
    json_path: PathBuf,

    /// Environment to load: dev, test, demo, or production.
    #[arg(long = "config", default_value = "dev")]
    config: String,

    /// Optional KEY=VALUE file with additional configuration.
    #[arg(long = "env")]
    env: Option<PathBuf>,

    /// Directory holding the per-environment TOML files.
    #[arg(long = "config-dir", default_value = "config")]
    config_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    custodian_daemon::init_tracing();

    let mut config = Config::load(&args.config_dir, &args.config)?;
    if let Some(env_file) = &args.env {
        config.apply_env_file(env_file)?;
    }

    let raw = std::fs::read_to_string(&args.json_path)
        .with_context(|| format!("cannot read {}", args.json_path.display()))?;
    let mut envelope: serde_json::Value =
        serde_json::from_str(&raw).context("trouble file is not JSON")?;

    // The persisted envelope carries the retry=false that sent it here.
    if let Some(object) = envelope.as_object_mut() {
        if object.contains_key("retry") {
            object.insert("retry".to_string(), serde_json::Value::Bool(true));
        }
    }

    let broker = HttpBroker::new(&config.broker_url);
    broker
        .publish(&args.topic, serde_json::to_vec(&envelope)?)
        .await?;

    tracing::info!(topic = %args.topic, path = %args.json_path.display(), "Envelope requeued");
    Ok(())
}
