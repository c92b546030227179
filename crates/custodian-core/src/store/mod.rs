//! Object store seam.
//!
//! The real store is an external S3-compatible service; workers only see
//! this trait. The single-vs-multipart decision, the rewind-and-retry
//! loop, and the metadata header contents all live in the workers; an
//! implementation just moves bytes and enforces the integrity header.

mod fs;

pub use fs::FsStore;

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Listing/head entry for one stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

/// Upload options: integrity header plus `x-amz-meta-*` pairs.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Base64 of the raw MD5 bytes. The store must reject the upload if
    /// the received bytes hash differently.
    pub content_md5: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl PutOptions {
    pub fn with_md5(md5_hex: &str) -> anyhow::Result<Self> {
        Ok(Self {
            content_md5: Some(crate::digests::md5_hex_to_base64(md5_hex)?),
            metadata: HashMap::new(),
        })
    }

    pub fn meta(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// S3-style blob operations the pipeline needs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn head(&self, bucket: &str, key: &str) -> anyhow::Result<Option<ObjectMeta>>;

    /// Stream an object to a local file. Returns the stored object's meta.
    async fn get_to_file(&self, bucket: &str, key: &str, dest: &Path) -> anyhow::Result<ObjectMeta>;

    /// Single-request upload. Returns the etag.
    async fn put_file(
        &self,
        bucket: &str,
        key: &str,
        src: &Path,
        opts: &PutOptions,
    ) -> anyhow::Result<String>;

    /// Multipart upload in `part_size` chunks. Returns the etag.
    async fn put_file_multipart(
        &self,
        bucket: &str,
        key: &str,
        src: &Path,
        part_size: u64,
        opts: &PutOptions,
    ) -> anyhow::Result<String>;

    /// Server-side copy; no bytes touch local disk.
    async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> anyhow::Result<()>;

    async fn delete(&self, bucket: &str, key: &str) -> anyhow::Result<()>;

    async fn list(&self, bucket: &str, prefix: &str) -> anyhow::Result<Vec<ObjectMeta>>;

    /// Stable URL recorded in the registry for a stored object.
    fn url_for(&self, bucket: &str, key: &str) -> String;
}
