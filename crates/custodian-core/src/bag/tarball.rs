//! Tar pack/unpack on the blocking pool.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Tar a bag directory. Entries are rooted at `base_name/` so the archive
/// unpacks into a single directory.
pub async fn pack(dir: &Path, tar_path: &Path, base_name: &str) -> Result<()> {
    let dir = dir.to_path_buf();
    let tar_path = tar_path.to_path_buf();
    let base_name = base_name.to_string();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::create(&tar_path)
            .with_context(|| format!("cannot create {}", tar_path.display()))?;
        let mut builder = tar::Builder::new(file);
        builder.append_dir_all(&base_name, &dir)?;
        builder.into_inner()?.sync_all()?;
        Ok(())
    })
    .await?
}

/// Unpack a bag tar into `dest_dir` and return the bag root.
///
/// The archive must contain exactly one top-level directory; a flat or
/// multi-rooted tar is a content defect the caller turns into a terminal
/// validation failure.
pub async fn unpack(tar_path: &Path, dest_dir: &Path) -> Result<PathBuf> {
    let tar_path = tar_path.to_path_buf();
    let dest_dir = dest_dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        std::fs::create_dir_all(&dest_dir)?;
        let file = std::fs::File::open(&tar_path)
            .with_context(|| format!("cannot open {}", tar_path.display()))?;
        let mut archive = tar::Archive::new(file);
        archive
            .unpack(&dest_dir)
            .with_context(|| format!("cannot untar {}", tar_path.display()))?;

        let mut roots = Vec::new();
        for entry in std::fs::read_dir(&dest_dir)? {
            let path = entry?.path();
            if path.is_dir() {
                roots.push(path);
            }
        }
        match roots.as_slice() {
            [root] => Ok(root.clone()),
            _ => anyhow::bail!(
                "expected one top-level directory in {}, found {}",
                tar_path.display(),
                roots.len()
            ),
        }
    })
    .await?
}
