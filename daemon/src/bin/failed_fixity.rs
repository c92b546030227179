//! Persists failed fixity checks for operator review.

use custodian_core::workers::{topics, TroubleProcessor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ctx = custodian_daemon::init("failed_fixity")?;
    custodian_daemon::run_until_shutdown(TroubleProcessor::run(ctx, topics::FAILED_FIXITY)).await
}
