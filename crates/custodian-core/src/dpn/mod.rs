//! Cross-node replication worker family.
//!
//! A second pipeline with its own topics, moving whole bags between
//! peer preservation nodes:
//!
//! ```text
//! INBOUND (a peer asks us to hold a copy)
//! dpn_copy → Copier → dpn_validation → Validator → dpn_store → Storer → dpn_record → Recorder
//!
//! OUTBOUND (we package one of our objects for a peer)
//! dpn_package → Packager ─┘ (joins at dpn_validation)
//! ```
//!
//! Transfer state, remote-perspective:
//! Requested → Received → Stored → Confirmed, or Cancelled on any
//! terminal failure.

mod checkpoint;
mod copier;
mod node_client;
mod packager;
mod recorder;
mod storer;
mod validator;

pub use checkpoint::LastCheck;
pub use copier::DpnCopier;
pub use node_client::{HttpNodeClient, MemoryNodeClient, NodeClient, NodeClients};
pub use packager::{DpnPackageRequest, DpnPackager};
pub use recorder::DpnRecorder;
pub use storer::DpnStorer;
pub use validator::DpnValidator;

use crate::models::DpnResult;

/// Staged tar location for one bag.
pub(crate) fn staging_tar(
    config: &crate::config::DpnConfig,
    bag_uuid: &uuid::Uuid,
) -> std::path::PathBuf {
    config.staging_dir.join(format!("{bag_uuid}.tar"))
}

/// Outbound pickup location for a packaged bag.
pub(crate) fn outbound_tar(
    config: &crate::config::DpnConfig,
    to_node: &str,
    bag_uuid: &uuid::Uuid,
) -> std::path::PathBuf {
    config
        .staging_dir
        .join("outbound")
        .join(to_node)
        .join(format!("{bag_uuid}.tar"))
}

pub(crate) fn log_result(ctx: &crate::ProcessContext, worker: &str, result: &DpnResult) {
    ctx.log_envelope(worker, result);
}
