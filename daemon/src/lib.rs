//! Shared bootstrap for the worker binaries.
//!
//! Every worker daemon takes `-config=<env>` naming the environment
//! (`dev|test|demo|production`) and an optional `-env=<file>` with
//! KEY=VALUE secrets. Startup failures exit non-zero; a clean shutdown
//! (Ctrl+C, broker disconnect) exits zero.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;

use custodian_core::queue::http::HttpBroker;
use custodian_core::registry::HttpRegistry;
use custodian_core::store::FsStore;
use custodian_core::{Config, ProcessContext};

#[derive(Parser, Debug)]
#[command(name = "custodian")]
#[command(about = "Preservation archive worker")]
pub struct Args {
    /// Environment to load: dev, test, demo, or production.
    #[arg(long = "config", default_value = "dev")]
    pub config: String,

    /// Optional KEY=VALUE file with additional configuration (secrets).
    #[arg(long = "env")]
    pub env: Option<PathBuf>,

    /// Directory holding the per-environment TOML files.
    #[arg(long = "config-dir", default_value = "config")]
    pub config_dir: PathBuf,
}

/// Parse args, initialize logging, build the shared context.
pub fn init(worker: &str) -> anyhow::Result<Arc<ProcessContext>> {
    let args = Args::parse();
    init_tracing();

    let mut config = Config::load(&args.config_dir, &args.config)
        .with_context(|| format!("cannot load {} configuration", args.config))?;
    if let Some(env_file) = &args.env {
        config.apply_env_file(env_file)?;
    }
    config.ensure_dirs().context("cannot create working directories")?;

    tracing::info!(
        worker,
        environment = %config.environment,
        staging = %config.staging_dir.display(),
        "Starting"
    );

    let store = Arc::new(FsStore::new(&config.store_root));
    let registry = Arc::new(HttpRegistry::new(&config.registry_url, &config.registry_token));
    let broker = Arc::new(HttpBroker::new(&config.broker_url));
    Ok(ProcessContext::new(config, store, registry, broker))
}

/// JSON logs when `CUSTODIAN_LOG_JSON` is set, human format otherwise.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("custodian=info".parse().expect("static directive parses"));
    if std::env::var("CUSTODIAN_LOG_JSON").is_ok() {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Drive a worker until it stops or the process is interrupted.
pub async fn run_until_shutdown<F>(worker: F) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    tokio::select! {
        outcome = worker => {
            tracing::info!("Worker loop ended");
            outcome
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            Ok(())
        }
    }
}
