//! Filesystem-backed object store.
//!
//! Buckets are directories under one root; metadata lives in a parallel
//! `.meta` tree as JSON sidecars. Used by the test suite and local dev;
//! behaviorally it matches the production store where the pipeline cares:
//! the integrity header is enforced, multipart etags get a part-count
//! suffix, and deletes of missing keys succeed.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{ObjectMeta, ObjectStore, PutOptions};
use crate::digests;

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    etag: String,
    size: u64,
    last_modified: chrono::DateTime<Utc>,
    metadata: std::collections::HashMap<String, String>,
}

pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }

    fn sidecar_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(".meta").join(bucket).join(format!("{key}.json"))
    }

    async fn read_sidecar(&self, bucket: &str, key: &str) -> anyhow::Result<Option<Sidecar>> {
        let path = self.sidecar_path(bucket, key);
        match tokio::fs::read(&path).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_sidecar(&self, bucket: &str, key: &str, sidecar: &Sidecar) -> anyhow::Result<()> {
        let path = self.sidecar_path(bucket, key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, serde_json::to_vec_pretty(sidecar)?).await?;
        Ok(())
    }

    async fn store_file(
        &self,
        bucket: &str,
        key: &str,
        src: &Path,
        opts: &PutOptions,
        etag_suffix: Option<u64>,
    ) -> anyhow::Result<String> {
        let (md5_hex, _) = digests::md5_and_sha256(src).await?;

        // The integrity header: reject the put if the bytes we received
        // hash differently than the caller promised.
        if let Some(expected) = &opts.content_md5 {
            let actual = digests::md5_hex_to_base64(&md5_hex)?;
            if *expected != actual {
                anyhow::bail!("content-md5 mismatch: header {expected}, body {actual}");
            }
        }

        let dest = self.object_path(bucket, key);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(src, &dest).await?;

        let size = tokio::fs::metadata(&dest).await?.len();
        let etag = match etag_suffix {
            Some(parts) => format!("{md5_hex}-{parts}"),
            None => md5_hex,
        };
        self.write_sidecar(
            bucket,
            key,
            &Sidecar {
                etag: etag.clone(),
                size,
                last_modified: Utc::now(),
                metadata: opts.metadata.clone(),
            },
        )
        .await?;
        Ok(etag)
    }
}

#[async_trait]
impl ObjectStore for FsStore {
    async fn head(&self, bucket: &str, key: &str) -> anyhow::Result<Option<ObjectMeta>> {
        Ok(self.read_sidecar(bucket, key).await?.map(|s| ObjectMeta {
            key: key.to_string(),
            size: s.size,
            etag: s.etag,
            last_modified: s.last_modified,
        }))
    }

    async fn get_to_file(&self, bucket: &str, key: &str, dest: &Path) -> anyhow::Result<ObjectMeta> {
        let src = self.object_path(bucket, key);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&src, dest)
            .await
            .map_err(|e| anyhow::anyhow!("cannot fetch {bucket}/{key}: {e}"))?;
        self.head(bucket, key)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no metadata for {bucket}/{key}"))
    }

    async fn put_file(
        &self,
        bucket: &str,
        key: &str,
        src: &Path,
        opts: &PutOptions,
    ) -> anyhow::Result<String> {
        self.store_file(bucket, key, src, opts, None).await
    }

    async fn put_file_multipart(
        &self,
        bucket: &str,
        key: &str,
        src: &Path,
        part_size: u64,
        opts: &PutOptions,
    ) -> anyhow::Result<String> {
        let size = tokio::fs::metadata(src).await?.len();
        let parts = size.div_ceil(part_size).max(1);
        self.store_file(bucket, key, src, opts, Some(parts)).await
    }

    async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> anyhow::Result<()> {
        let sidecar = self
            .read_sidecar(src_bucket, src_key)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no such object {src_bucket}/{src_key}"))?;

        let dest = self.object_path(dst_bucket, dst_key);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(self.object_path(src_bucket, src_key), &dest).await?;
        self.write_sidecar(dst_bucket, dst_key, &sidecar).await?;
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> anyhow::Result<()> {
        for path in [self.object_path(bucket, key), self.sidecar_path(bucket, key)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> anyhow::Result<Vec<ObjectMeta>> {
        let meta_root = self.root.join(".meta").join(bucket);
        let mut out = Vec::new();
        let mut stack = vec![meta_root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let rel = path.strip_prefix(&meta_root)?.to_string_lossy().to_string();
                let key = rel.strip_suffix(".json").unwrap_or(&rel).to_string();
                if !key.starts_with(prefix) {
                    continue;
                }
                let raw = tokio::fs::read(&path).await?;
                let sidecar: Sidecar = serde_json::from_slice(&raw)?;
                out.push(ObjectMeta {
                    key,
                    size: sidecar.size,
                    etag: sidecar.etag,
                    last_modified: sidecar.last_modified,
                });
            }
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    fn url_for(&self, bucket: &str, key: &str) -> String {
        format!("file://{}/{bucket}/{key}", self.root.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_file(content: &[u8]) -> (tempfile::TempDir, FsStore, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        tokio::fs::write(&src, content).await.unwrap();
        let store = FsStore::new(&dir.path().join("store"));
        (dir, store, src)
    }

    #[tokio::test]
    async fn test_put_head_get_round_trip() {
        let (_dir, store, src) = store_with_file(b"payload").await;
        let opts = PutOptions::default().meta("institution", "test.edu");

        let etag = store.put_file("bucket", "a/b.bin", &src, &opts).await.unwrap();
        let head = store.head("bucket", "a/b.bin").await.unwrap().unwrap();
        assert_eq!(head.etag, etag);
        assert_eq!(head.size, 7);

        let dest = src.parent().unwrap().join("fetched.bin");
        store.get_to_file("bucket", "a/b.bin", &dest).await.unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_bad_content_md5_is_rejected() {
        let (_dir, store, src) = store_with_file(b"payload").await;
        let opts = PutOptions::with_md5("d41d8cd98f00b204e9800998ecf8427e").unwrap();
        let err = store.put_file("bucket", "k", &src, &opts).await.unwrap_err();
        assert!(err.to_string().contains("content-md5 mismatch"));
        assert!(store.head("bucket", "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_multipart_etag_carries_part_count() {
        let (_dir, store, src) = store_with_file(&[0u8; 1000]).await;
        let etag = store
            .put_file_multipart("bucket", "big", &src, 300, &PutOptions::default())
            .await
            .unwrap();
        assert!(etag.ends_with("-4"));
    }

    #[tokio::test]
    async fn test_copy_and_delete() {
        let (_dir, store, src) = store_with_file(b"x").await;
        store
            .put_file("preservation", "uuid-1", &src, &PutOptions::default())
            .await
            .unwrap();
        store
            .copy_object("preservation", "uuid-1", "replication", "uuid-1")
            .await
            .unwrap();
        assert!(store.head("replication", "uuid-1").await.unwrap().is_some());

        store.delete("preservation", "uuid-1").await.unwrap();
        assert!(store.head("preservation", "uuid-1").await.unwrap().is_none());
        // Deleting a missing key is not an error.
        store.delete("preservation", "uuid-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_filters_by_prefix() {
        let (_dir, store, src) = store_with_file(b"x").await;
        for key in ["dpn.preservation/a.tar", "dpn.preservation/b.tar", "other/c"] {
            store.put_file("bucket", key, &src, &PutOptions::default()).await.unwrap();
        }
        let listed = store.list("bucket", "dpn.preservation/").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|m| m.key.starts_with("dpn.preservation/")));
    }
}
