//! Re-verifies stored file digests.

use custodian_core::workers::FixityChecker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ctx = custodian_daemon::init("fixity")?;
    custodian_daemon::run_until_shutdown(FixityChecker::run(ctx)).await
}
