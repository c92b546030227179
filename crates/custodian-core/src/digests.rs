//! Streaming digest helpers.
//!
//! Everything fixity-related runs through here so no caller ever loads a
//! multi-gigabyte payload into memory. File reads happen on the blocking
//! pool.

use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use md5::{Digest as _, Md5};
use sha2::Sha256;

const BUF_SIZE: usize = 64 * 1024;

/// MD5 and SHA-256 of a file, hex-encoded, in one pass.
pub async fn md5_and_sha256(path: &Path) -> Result<(String, String)> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)
            .with_context(|| format!("cannot open {}", path.display()))?;
        let mut md5 = Md5::new();
        let mut sha256 = Sha256::new();
        let mut buf = vec![0u8; BUF_SIZE];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            md5.update(&buf[..n]);
            sha256.update(&buf[..n]);
        }
        Ok((hex::encode(md5.finalize()), hex::encode(sha256.finalize())))
    })
    .await?
}

/// Hex MD5 of a file.
pub async fn md5_file(path: &Path) -> Result<String> {
    Ok(md5_and_sha256(path).await?.0)
}

/// Hex SHA-256 of a file.
pub async fn sha256_file(path: &Path) -> Result<String> {
    Ok(md5_and_sha256(path).await?.1)
}

/// Base64 of the raw MD5 bytes, the form object stores take as an
/// integrity header.
pub fn md5_hex_to_base64(md5_hex: &str) -> Result<String> {
    use base64::Engine as _;
    let raw = hex::decode(md5_hex).context("md5 is not valid hex")?;
    Ok(base64::engine::general_purpose::STANDARD.encode(raw))
}
