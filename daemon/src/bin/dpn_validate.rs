//! Verifies staged peer bags against their transfer fixities.

use std::sync::Arc;

use custodian_core::dpn::{DpnValidator, NodeClients};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ctx = custodian_daemon::init("dpn_validation")?;
    let nodes = Arc::new(NodeClients::from_config(&ctx.config.dpn));
    custodian_daemon::run_until_shutdown(DpnValidator::run(ctx, nodes)).await
}
