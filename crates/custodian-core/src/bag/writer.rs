//! Bag assembly for restoration and outbound replication.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Utc;

use super::Tag;
use crate::digests;

/// Builds a bag directory: callers drop files under `data/`, then
/// `finish` regenerates both manifests and writes the tag files.
pub struct BagWriter {
    root: PathBuf,
    tags: Vec<Tag>,
}

impl BagWriter {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            tags: Vec::new(),
        }
    }

    pub fn add_tag(&mut self, label: &str, value: &str) {
        self.tags.push(Tag {
            label: label.to_string(),
            value: value.to_string(),
        });
    }

    /// Absolute destination for a bag-relative payload path, with parent
    /// directories created.
    pub async fn payload_path(&self, relative: &str) -> Result<PathBuf> {
        let relative = relative.strip_prefix("data/").unwrap_or(relative);
        let dest = self.root.join("data").join(relative);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(dest)
    }

    /// Write bagit.txt, bag-info.txt, and both payload manifests.
    pub async fn finish(self) -> Result<()> {
        let data_dir = self.root.join("data");
        tokio::fs::create_dir_all(&data_dir).await?;

        let mut files = Vec::new();
        collect(&data_dir, &mut files)?;
        files.sort();

        let mut manifest_md5 = String::new();
        let mut manifest_sha256 = String::new();
        for abs in &files {
            let rel = abs
                .strip_prefix(&self.root)
                .expect("payload under root")
                .to_string_lossy()
                .replace('\\', "/");
            let (md5, sha256) = digests::md5_and_sha256(abs).await?;
            manifest_md5.push_str(&format!("{md5} {rel}\n"));
            manifest_sha256.push_str(&format!("{sha256} {rel}\n"));
        }
        tokio::fs::write(self.root.join("manifest-md5.txt"), manifest_md5).await?;
        tokio::fs::write(self.root.join("manifest-sha256.txt"), manifest_sha256).await?;

        tokio::fs::write(
            self.root.join("bagit.txt"),
            "BagIt-Version: 0.97\nTag-File-Character-Encoding: UTF-8\n",
        )
        .await?;

        let mut info = format!("Bagging-Date: {}\n", Utc::now().format("%Y-%m-%d"));
        for tag in &self.tags {
            info.push_str(&format!("{}: {}\n", tag.label, tag.value));
        }
        tokio::fs::write(self.root.join("bag-info.txt"), info).await?;
        Ok(())
    }
}

fn collect(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bag::read_bag;

    #[tokio::test]
    async fn test_written_bag_validates() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("restored_bag");
        tokio::fs::create_dir_all(&root).await.unwrap();

        let mut writer = BagWriter::new(&root);
        writer.add_tag("Source-Organization", "Test University");

        let a = writer.payload_path("data/a.txt").await.unwrap();
        tokio::fs::write(&a, "alpha\n").await.unwrap();
        let b = writer.payload_path("data/nested/b.txt").await.unwrap();
        tokio::fs::write(&b, "beta\n").await.unwrap();
        writer.finish().await.unwrap();

        let result = read_bag(&root).await.unwrap();
        assert!(result.errors.is_empty(), "{:?}", result.errors);
        assert_eq!(result.payload.len(), 2);
        assert_eq!(result.tag_value("Source-Organization"), Some("Test University"));
    }
}
