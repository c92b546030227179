//! Fetches, unpacks, and validates received bags.

use custodian_core::workers::BagPreparer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ctx = custodian_daemon::init("prepare")?;
    custodian_daemon::run_until_shutdown(BagPreparer::run(ctx)).await
}
