//! Scan checkpoint for the cross-node request scanner.
//!
//! One plain-text file holding the ISO-8601 instant of the last
//! successful transfer-request scan; the scanner reads it to build its
//! `after=` filter and writes it back after each pass.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};

pub struct LastCheck {
    path: PathBuf,
}

impl LastCheck {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// The recorded instant, or None before the first scan.
    pub async fn read(&self) -> Result<Option<DateTime<Utc>>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => {
                let parsed = raw
                    .trim()
                    .parse::<DateTime<Utc>>()
                    .with_context(|| format!("bad timestamp in {}", self.path.display()))?;
                Ok(Some(parsed))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write(&self, when: DateTime<Utc>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, when.to_rfc3339_opts(SecondsFormat::Secs, true))
            .await
            .with_context(|| format!("cannot write {}", self.path.display()))?;
        Ok(())
    }
}
