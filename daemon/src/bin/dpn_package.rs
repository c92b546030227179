//! Packages local objects as cross-node bags.

use custodian_core::dpn::DpnPackager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ctx = custodian_daemon::init("dpn_package")?;
    custodian_daemon::run_until_shutdown(DpnPackager::run(ctx)).await
}
