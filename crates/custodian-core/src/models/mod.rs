//! Work items and registry records moved through the pipelines.
//!
//! Everything here is plain serde data. The ingest family revolves around
//! [`ProcessResult`]; the cross-node family around [`DpnResult`]. Registry
//! records ([`IntellectualObject`], [`GenericFile`], [`PremisEvent`],
//! [`ProcessStatus`]) mirror what the archival registry stores.

mod cleanup_result;
mod dpn;
mod fedora_result;
mod generic_file;
mod intellectual_object;
mod premis_event;
mod process_result;
mod process_status;
mod s3_file;

pub use cleanup_result::{CleanupFile, CleanupResult};
pub use dpn::{DpnBag, DpnReplicationTransfer, DpnResult, DpnStage, TransferStatus};
pub use fedora_result::{EntityType, FedoraResult, RegistryAction, RegistryCall};
pub use generic_file::GenericFile;
pub use intellectual_object::IntellectualObject;
pub use premis_event::{EventOutcome, EventType, PremisEvent};
pub use process_result::{FetchResult, ProcessResult, Stage, Status, TarResult};
pub use process_status::{Action, ProcessStatus};
pub use s3_file::S3File;
