//! Registers objects, files, and events in the archival registry.

use custodian_core::workers::BagRecorder;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ctx = custodian_daemon::init("record")?;
    custodian_daemon::run_until_shutdown(BagRecorder::run(ctx)).await
}
