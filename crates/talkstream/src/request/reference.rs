//! Input references: where a visual or audio asset comes from.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::sanitize;

/// A resolved, syntactically valid asset reference.
#[derive(Clone, PartialEq, Eq)]
pub enum AssetRef {
    Url(String),
    /// Decoded base64 payload; `mime` is known only for `data:` URLs.
    Inline {
        mime: Option<String>,
        bytes: Vec<u8>,
    },
    Path(PathBuf),
}

impl AssetRef {
    /// Classifies and decodes a raw reference string.
    ///
    /// `volume_roots` restricts path references when non-empty.
    pub fn parse(raw: &str, volume_roots: &[PathBuf]) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("must not be empty".to_string());
        }

        if let Some(rest) = raw
            .strip_prefix("https://")
            .or_else(|| raw.strip_prefix("http://"))
        {
            let host = rest.split(['/', '?', '#']).next().unwrap_or("");
            if host.is_empty() || host.ends_with('@') {
                return Err("URL has no host".to_string());
            }
            return Ok(AssetRef::Url(raw.to_string()));
        }

        if let Some(rest) = raw.strip_prefix("data:") {
            let (header, payload) = rest
                .split_once(',')
                .ok_or_else(|| "data URL has no payload".to_string())?;
            let mime = header
                .strip_suffix(";base64")
                .ok_or_else(|| "data URL must be base64 encoded".to_string())?;
            let bytes = decode_base64(payload)?;
            let mime = (!mime.is_empty()).then(|| mime.to_string());
            return Ok(AssetRef::Inline { mime, bytes });
        }

        if raw.starts_with('/')
            || raw.starts_with("./")
            || volume_roots.iter().any(|root| Path::new(raw).starts_with(root))
        {
            return parse_path(raw, volume_roots).map(AssetRef::Path);
        }

        match decode_base64(raw) {
            Ok(bytes) => Ok(AssetRef::Inline { mime: None, bytes }),
            Err(_) if looks_like_path(raw) => parse_path(raw, volume_roots).map(AssetRef::Path),
            Err(_) => Err("must be an http(s) URL, a base64 payload or a volume path".to_string()),
        }
    }

    /// Log-safe description (no query strings, no payload bytes).
    pub fn describe(&self) -> String {
        match self {
            AssetRef::Url(url) => sanitize::redact_url(url),
            AssetRef::Inline { mime, bytes } => format!(
                "inline {} ({} bytes)",
                mime.as_deref().unwrap_or("unknown"),
                bytes.len()
            ),
            AssetRef::Path(path) => sanitize::redact_path(path),
        }
    }
}

impl fmt::Debug for AssetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AssetRef({})", self.describe())
    }
}

/// A reference with an optional expected SHA-256 digest of its content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetInput {
    pub source: AssetRef,
    /// Lowercase hex.
    pub checksum_sha256: Option<String>,
}

impl AssetInput {
    pub fn new(source: AssetRef) -> Self {
        Self {
            source,
            checksum_sha256: None,
        }
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum_sha256 = Some(checksum.into());
        self
    }
}

/// Normalizes a hex SHA-256 digest.
pub fn parse_checksum(raw: &str) -> Result<String, String> {
    let digest = raw.trim().to_ascii_lowercase();
    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err("must be a 64 character hex sha256 digest".to_string());
    }
    Ok(digest)
}

/// Bare relative paths such as `inputs/a.wav`: no whitespace, and a path
/// separator or a file extension.
fn looks_like_path(raw: &str) -> bool {
    if raw.chars().any(char::is_whitespace) {
        return false;
    }
    let path = Path::new(raw);
    raw.contains('/') || path.extension().is_some_and(|ext| !ext.is_empty())
}

fn decode_base64(payload: &str) -> Result<Vec<u8>, String> {
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| format!("invalid base64 payload: {}", e))?;
    if bytes.is_empty() {
        return Err("base64 payload is empty".to_string());
    }
    Ok(bytes)
}

fn parse_path(raw: &str, volume_roots: &[PathBuf]) -> Result<PathBuf, String> {
    let path = Path::new(raw);
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err("volume path must not contain '..'".to_string());
    }
    if !volume_roots.is_empty() && !volume_roots.iter().any(|root| path.starts_with(root)) {
        return Err("volume path is outside the allowed volume roots".to_string());
    }
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_http_url() {
        let r = AssetRef::parse(" https://cdn.example.com/face.png?sig=1 ", &[]).unwrap();
        assert_eq!(
            r,
            AssetRef::Url("https://cdn.example.com/face.png?sig=1".to_string())
        );
        assert_eq!(r.describe(), "https://cdn.example.com/face.png?…");
    }

    #[test]
    fn test_parse_url_without_host() {
        assert!(AssetRef::parse("https:///nohost", &[]).is_err());
    }

    #[test]
    fn test_parse_data_url() {
        let r = AssetRef::parse("data:audio/wav;base64,UklGRg==", &[]).unwrap();
        match r {
            AssetRef::Inline { mime, bytes } => {
                assert_eq!(mime.as_deref(), Some("audio/wav"));
                assert_eq!(bytes, b"RIFF");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_data_url_must_be_base64() {
        let err = AssetRef::parse("data:text/plain,hello", &[]).unwrap_err();
        assert!(err.contains("base64"));
    }

    #[test]
    fn test_parse_raw_base64() {
        let r = AssetRef::parse("aGVsbG8gd29ybGQ=", &[]).unwrap();
        assert_eq!(
            r,
            AssetRef::Inline {
                mime: None,
                bytes: b"hello world".to_vec()
            }
        );
    }

    #[test]
    fn test_parse_volume_path_inside_root() {
        let roots = vec![PathBuf::from("/runpod-volume")];
        let r = AssetRef::parse("/runpod-volume/refs/a.png", &roots).unwrap();
        assert_eq!(r, AssetRef::Path(PathBuf::from("/runpod-volume/refs/a.png")));
    }

    #[test]
    fn test_volume_path_outside_root_is_rejected() {
        let roots = vec![PathBuf::from("/runpod-volume")];
        assert!(AssetRef::parse("/etc/passwd", &roots).is_err());
    }

    #[test]
    fn test_volume_path_traversal_is_rejected() {
        let err = AssetRef::parse("/runpod-volume/../etc/passwd", &[]).unwrap_err();
        assert!(err.contains(".."));
    }

    #[test]
    fn test_bare_relative_path_is_a_volume_path() {
        let r = AssetRef::parse("inputs/a.wav", &[]).unwrap();
        assert_eq!(r, AssetRef::Path(PathBuf::from("inputs/a.wav")));
        assert_eq!(
            AssetRef::parse("face.png", &[]).unwrap(),
            AssetRef::Path(PathBuf::from("face.png"))
        );
    }

    #[test]
    fn test_relative_path_is_checked_against_roots() {
        let roots = vec![PathBuf::from("/runpod-volume")];
        let err = AssetRef::parse("inputs/a.wav", &roots).unwrap_err();
        assert!(err.contains("volume roots"), "{}", err);
        assert!(AssetRef::parse("inputs/../../etc/passwd", &[]).is_err());
    }

    #[test]
    fn test_parse_checksum() {
        let digest = "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD";
        assert_eq!(parse_checksum(digest).unwrap(), digest.to_ascii_lowercase());
        assert!(parse_checksum("abc").is_err());
        assert!(parse_checksum(&"z".repeat(64)).is_err());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(AssetRef::parse("not a reference!", &[]).is_err());
    }

    #[test]
    fn test_debug_does_not_dump_bytes() {
        let r = AssetRef::Inline {
            mime: Some("image/png".to_string()),
            bytes: vec![0u8; 4096],
        };
        assert_eq!(format!("{:?}", r), "AssetRef(inline image/png (4096 bytes))");
    }
}
