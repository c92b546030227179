//! Rebuilds bags from preservation storage on request.

use custodian_core::workers::BagRestorer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ctx = custodian_daemon::init("restore")?;
    custodian_daemon::run_until_shutdown(BagRestorer::run(ctx)).await
}
