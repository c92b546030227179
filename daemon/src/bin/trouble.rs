//! Persists exhausted ingest envelopes for operator review.

use custodian_core::workers::{topics, TroubleProcessor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ctx = custodian_daemon::init("trouble")?;
    custodian_daemon::run_until_shutdown(TroubleProcessor::run(ctx, topics::TROUBLE)).await
}
