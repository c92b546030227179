//! Removes whole bags from long-term storage on request.

use custodian_core::workers::BagDeleter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ctx = custodian_daemon::init("bag_delete")?;
    custodian_daemon::run_until_shutdown(BagDeleter::run(ctx)).await
}
