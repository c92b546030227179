//! A pending upload sitting in an institution's receiving bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One object in a receiving bucket, as reported by the bucket scanner.
///
/// This is the envelope the prepare topic carries. Identity is
/// `bucket/key`; the struct is never mutated after deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct S3File {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub etag: String,
}

impl S3File {
    /// `bucket/key`, the at-most-once key for the ingest pipeline.
    pub fn identifier(&self) -> String {
        format!("{}/{}", self.bucket, self.key)
    }

    /// Bag name with the `.tar` extension stripped.
    pub fn bag_name(&self) -> &str {
        self.key.strip_suffix(".tar").unwrap_or(&self.key)
    }

    /// Institution domain parsed off the receiving bucket name.
    ///
    /// Receiving buckets are named `<prefix><institution>`, e.g.
    /// `custodian.receive.test.edu` → `test.edu`.
    pub fn institution(&self, receiving_prefix: &str) -> &str {
        self.bucket.strip_prefix(receiving_prefix).unwrap_or(&self.bucket)
    }

    /// Etags from single-part uploads are plain MD5 hex; multipart etags
    /// carry a `-<parts>` suffix and cannot be compared to a digest.
    pub fn etag_is_md5(&self) -> bool {
        !self.etag.contains('-') && self.etag.len() == 32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> S3File {
        S3File {
            bucket: "custodian.receive.test.edu".into(),
            key: "photos_2019.tar".into(),
            size: 1024,
            last_modified: Utc::now(),
            etag: "0123456789abcdef0123456789abcdef".into(),
        }
    }

    #[test]
    fn test_identifier_and_bag_name() {
        let f = sample();
        assert_eq!(f.identifier(), "custodian.receive.test.edu/photos_2019.tar");
        assert_eq!(f.bag_name(), "photos_2019");
    }

    #[test]
    fn test_institution_from_bucket() {
        let f = sample();
        assert_eq!(f.institution("custodian.receive."), "test.edu");
    }

    #[test]
    fn test_multipart_etag_is_not_md5() {
        let mut f = sample();
        assert!(f.etag_is_md5());
        f.etag = "0123456789abcdef0123456789abcdef-14".into();
        assert!(!f.etag_is_md5());
    }
}
