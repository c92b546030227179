//! Records stored cross-node bags in both registries.

use std::sync::Arc;

use custodian_core::dpn::{DpnRecorder, NodeClients};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ctx = custodian_daemon::init("dpn_record")?;
    let nodes = Arc::new(NodeClients::from_config(&ctx.config.dpn));
    custodian_daemon::run_until_shutdown(DpnRecorder::run(ctx, nodes)).await
}
