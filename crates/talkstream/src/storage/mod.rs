//! Artifact persistence: storage keys, checksums and the store backends.

pub mod filesystem;
pub mod http;
pub mod presigned;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::StoreError;

pub use filesystem::FilesystemStore;
pub use http::HttpObjectStore;
pub use presigned::{unsigned_location, PresignedUploader};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `bytes` under `key`, replacing any previous object, and returns
    /// its location.
    async fn put(&self, key: &str, bytes: Vec<u8>, mime: &str) -> Result<String, StoreError>;

    /// Unsigned location a client can fetch `key` from.
    async fn public_url(&self, key: &str) -> Result<String, StoreError>;
}

/// Storage keys of a job's three artifacts. Derived only from the job id,
/// item id and key parameters, so a retried job overwrites its own output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactKeys {
    pub video: String,
    pub thumbnail: String,
    pub metadata: String,
}

impl ArtifactKeys {
    pub fn for_job(prefix: &str, job_id: &str, item_id: Option<&str>, save_name: &str) -> Self {
        let mut dir: Vec<String> = prefix
            .split('/')
            .filter(|s| !s.is_empty())
            .map(key_segment)
            .collect();
        dir.push(key_segment(job_id));
        if let Some(item_id) = item_id {
            dir.push(key_segment(item_id));
        }
        let dir = dir.join("/");

        Self {
            video: format!("{}/{}.mp4", dir, key_segment(save_name)),
            thumbnail: format!("{}/thumbnail.jpg", dir),
            metadata: format!("{}/metadata.json", dir),
        }
    }
}

/// Sanitizes one key segment. A segment that had to be rewritten gets a
/// short digest of the raw value so distinct ids never share a key.
fn key_segment(raw: &str) -> String {
    let segment: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let segment = if segment.is_empty() || segment.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        segment
    };
    if segment == raw {
        segment
    } else {
        format!("{}-{}", segment, &checksum(raw.as_bytes())[..8])
    }
}

/// Rejects keys that could escape the store root.
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|s| s.is_empty() || s == "." || s == "..")
    {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Hex SHA-256 digest.
pub fn checksum(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_deterministic() {
        let a = ArtifactKeys::for_job("talkstream", "job-1", None, "talk_low_8_seed42");
        let b = ArtifactKeys::for_job("talkstream", "job-1", None, "talk_low_8_seed42");
        assert_eq!(a, b);
        assert_eq!(a.video, "talkstream/job-1/talk_low_8_seed42.mp4");
        assert_eq!(a.thumbnail, "talkstream/job-1/thumbnail.jpg");
        assert_eq!(a.metadata, "talkstream/job-1/metadata.json");
    }

    #[test]
    fn test_item_keys_are_scoped() {
        let keys = ArtifactKeys::for_job("out/videos/", "job-1", Some("item-2"), "talk");
        assert_eq!(keys.video, "out/videos/job-1/item-2/talk.mp4");
    }

    #[test]
    fn test_hostile_ids_stay_inside_prefix() {
        let keys = ArtifactKeys::for_job("p", "../../etc", Some(".."), "talk");
        let segments: Vec<&str> = keys.video.split('/').collect();
        assert_eq!(segments.len(), 4);
        assert_eq!(segments[0], "p");
        assert!(segments[1].starts_with(".._.._etc-"));
        assert!(segments[2].starts_with("_-"));
        assert_eq!(segments[3], "talk.mp4");
        assert!(validate_key(&keys.video).is_ok());
    }

    #[test]
    fn test_rewritten_ids_do_not_collide() {
        let slash = ArtifactKeys::for_job("p", "a/b", None, "talk");
        let underscore = ArtifactKeys::for_job("p", "a_b", None, "talk");
        assert_eq!(underscore.video, "p/a_b/talk.mp4");
        assert_ne!(slash.video, underscore.video);
        assert_eq!(
            slash.video,
            ArtifactKeys::for_job("p", "a/b", None, "talk").video
        );
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("a/b.mp4").is_ok());
        assert!(validate_key("/a/b.mp4").is_err());
        assert!(validate_key("a/../b.mp4").is_err());
        assert!(validate_key("a//b").is_err());
        assert!(validate_key("").is_err());
    }

    #[test]
    fn test_checksum_is_sha256_hex() {
        assert_eq!(
            checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
