//! Removes single files from long-term storage on request.

use custodian_core::workers::FileDeleter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ctx = custodian_daemon::init("file_delete")?;
    custodian_daemon::run_until_shutdown(FileDeleter::run(ctx)).await
}
