//! Copies preserved files to the replication bucket.

use custodian_core::workers::Replicator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ctx = custodian_daemon::init("replication")?;
    custodian_daemon::run_until_shutdown(Replicator::run(ctx)).await
}
