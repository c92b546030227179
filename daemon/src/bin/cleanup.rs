//! Deletes ingested tars from receiving buckets.

use custodian_core::workers::CleanupWorker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ctx = custodian_daemon::init("cleanup")?;
    custodian_daemon::run_until_shutdown(CleanupWorker::run(ctx)).await
}
