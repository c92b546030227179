//! Copies validated payload files to preservation storage.

use custodian_core::workers::BagStorer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ctx = custodian_daemon::init("store")?;
    custodian_daemon::run_until_shutdown(BagStorer::run(ctx)).await
}
