//! Pulls peer bags onto the local staging volume.

use std::sync::Arc;

use custodian_core::dpn::{DpnCopier, NodeClients};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ctx = custodian_daemon::init("dpn_copy")?;
    let nodes = Arc::new(NodeClients::from_config(&ctx.config.dpn));
    custodian_daemon::run_until_shutdown(DpnCopier::run(ctx, nodes)).await
}
