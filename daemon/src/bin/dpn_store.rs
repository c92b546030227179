//! Stores validated cross-node bags in preservation storage.

use custodian_core::dpn::DpnStorer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ctx = custodian_daemon::init("dpn_store")?;
    custodian_daemon::run_until_shutdown(DpnStorer::run(ctx)).await
}
