//! Directory → [`BagReadResult`].

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};

use super::{BagReadResult, PayloadFile, Tag};
use crate::digests;

const TAG_FILES: &[&str] = &["bagit.txt", "bag-info.txt", "aptrust-info.txt"];

/// Read and validate one unpacked bag.
///
/// Walks `data/`, computes MD5 and SHA-256 for every payload file, parses
/// tag files, and cross-checks both manifests. Structural problems land
/// in `errors` rather than failing the read; IO failures on the directory
/// itself are hard errors.
pub async fn read_bag(dir: &Path) -> Result<BagReadResult> {
    let mut result = BagReadResult {
        path: dir.to_path_buf(),
        tags: Vec::new(),
        payload: Vec::new(),
        errors: Vec::new(),
    };

    if !dir.join("bagit.txt").is_file() {
        result.errors.push("bagit.txt is missing".to_string());
    }
    for tag_file in TAG_FILES {
        let path = dir.join(tag_file);
        if path.is_file() {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("cannot read {}", path.display()))?;
            result.tags.extend(parse_tags(&raw));
        }
    }
    if dir.join("bagit.txt").is_file() && !result.tags.iter().any(|t| t.label == "BagIt-Version") {
        result.errors.push("bagit.txt has no BagIt-Version".to_string());
    }

    let data_dir = dir.join("data");
    if !data_dir.is_dir() {
        result.errors.push("data/ payload directory is missing".to_string());
        return Ok(result);
    }

    // Digest every payload file in one pass each.
    let mut paths = Vec::new();
    collect_files(&data_dir, &mut paths)?;
    paths.sort();
    for abs in paths {
        let rel = abs
            .strip_prefix(dir)
            .expect("payload path under bag root")
            .to_string_lossy()
            .replace('\\', "/");
        let size = tokio::fs::metadata(&abs).await?.len();
        let (md5, sha256) = digests::md5_and_sha256(&abs).await?;
        result.payload.push(PayloadFile {
            path: rel,
            size,
            md5,
            sha256,
        });
    }

    let mut manifests = 0;
    for (manifest, pick) in [
        ("manifest-md5.txt", DigestKind::Md5),
        ("manifest-sha256.txt", DigestKind::Sha256),
    ] {
        let path = dir.join(manifest);
        if !path.is_file() {
            continue;
        }
        manifests += 1;
        let raw = tokio::fs::read_to_string(&path).await?;
        check_manifest(&raw, manifest, pick, &result.payload, &mut result.errors);
    }
    if manifests == 0 {
        result.errors.push("no payload manifest present".to_string());
    }

    Ok(result)
}

#[derive(Clone, Copy)]
enum DigestKind {
    Md5,
    Sha256,
}

fn check_manifest(
    raw: &str,
    name: &str,
    kind: DigestKind,
    payload: &[PayloadFile],
    errors: &mut Vec<String>,
) {
    let by_path: HashMap<&str, &PayloadFile> =
        payload.iter().map(|f| (f.path.as_str(), f)).collect();
    let mut listed = 0usize;

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((digest, path)) = line.split_once(char::is_whitespace) else {
            errors.push(format!("{name}: unparseable line {line:?}"));
            continue;
        };
        let path = path.trim();
        listed += 1;
        match by_path.get(path) {
            None => errors.push(format!("{name} lists {path}, not present in payload")),
            Some(file) => {
                let actual = match kind {
                    DigestKind::Md5 => &file.md5,
                    DigestKind::Sha256 => &file.sha256,
                };
                if !digest.eq_ignore_ascii_case(actual) {
                    errors.push(format!(
                        "{name}: digest mismatch for {path}: manifest {digest}, computed {actual}"
                    ));
                }
            }
        }
    }

    if listed < payload.len() {
        for file in payload {
            if !raw.contains(&file.path) {
                errors.push(format!("{} is not listed in {name}", file.path));
            }
        }
    }
}

fn parse_tags(raw: &str) -> Vec<Tag> {
    let mut tags: Vec<Tag> = Vec::new();
    for line in raw.lines() {
        if line.starts_with(char::is_whitespace) {
            // Continuation of the previous tag value.
            if let Some(last) = tags.last_mut() {
                last.value.push(' ');
                last.value.push_str(line.trim());
            }
            continue;
        }
        if let Some((label, value)) = line.split_once(':') {
            tags.push(Tag {
                label: label.trim().to_string(),
                value: value.trim().to_string(),
            });
        }
    }
    tags
}

fn collect_files(dir: &Path, out: &mut Vec<std::path::PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

/// Content type from the file extension. The profile does not require
/// format identification beyond this.
pub fn mime_for(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or("");
    match ext.to_ascii_lowercase().as_str() {
        "txt" => "text/plain",
        "xml" => "application/xml",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "tif" | "tiff" => "image/tiff",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "wav" => "audio/wav",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn build_bag(dir: &Path, with_manifest: bool) {
        fs::create_dir_all(dir.join("data/sub")).unwrap();
        fs::write(dir.join("bagit.txt"), "BagIt-Version: 0.97\nTag-File-Character-Encoding: UTF-8\n").unwrap();
        fs::write(
            dir.join("bag-info.txt"),
            "Source-Organization: Test University\nBagging-Date: 2024-01-01\n",
        )
        .unwrap();
        fs::write(dir.join("data/hello.txt"), "hello\n").unwrap();
        fs::write(dir.join("data/sub/world.txt"), "world\n").unwrap();
        if with_manifest {
            fs::write(
                dir.join("manifest-md5.txt"),
                "b1946ac92492d2347c6235b4d2611184 data/hello.txt\n\
                 591785b794601e212b260e25925636fd data/sub/world.txt\n",
            )
            .unwrap();
        }
    }

    #[tokio::test]
    async fn test_valid_bag_reads_clean() {
        let dir = tempfile::tempdir().unwrap();
        build_bag(dir.path(), true);

        let result = read_bag(dir.path()).await.unwrap();
        assert!(result.errors.is_empty(), "{:?}", result.errors);
        assert_eq!(result.payload.len(), 2);
        assert_eq!(result.tag_value("Source-Organization"), Some("Test University"));
        assert_eq!(result.total_payload_size(), 12);
        result.require_valid().unwrap();
    }

    #[tokio::test]
    async fn test_missing_manifest_is_a_defect() {
        let dir = tempfile::tempdir().unwrap();
        build_bag(dir.path(), false);

        let result = read_bag(dir.path()).await.unwrap();
        assert!(result.errors.iter().any(|e| e.contains("no payload manifest")));
        assert!(result.require_valid().is_err());
    }

    #[tokio::test]
    async fn test_corrupt_payload_fails_fixity() {
        let dir = tempfile::tempdir().unwrap();
        build_bag(dir.path(), true);
        fs::write(dir.path().join("data/hello.txt"), "tampered\n").unwrap();

        let result = read_bag(dir.path()).await.unwrap();
        assert!(result.errors.iter().any(|e| e.contains("digest mismatch")));
    }

    #[tokio::test]
    async fn test_unlisted_payload_file_is_a_defect() {
        let dir = tempfile::tempdir().unwrap();
        build_bag(dir.path(), true);
        fs::write(dir.path().join("data/stowaway.bin"), "x").unwrap();

        let result = read_bag(dir.path()).await.unwrap();
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("stowaway.bin") && e.contains("not listed")));
    }

    #[test]
    fn test_mime_for_common_extensions() {
        assert_eq!(mime_for("data/a.pdf"), "application/pdf");
        assert_eq!(mime_for("data/a.TIF"), "image/tiff");
        assert_eq!(mime_for("data/no_extension"), "application/octet-stream");
    }
}
