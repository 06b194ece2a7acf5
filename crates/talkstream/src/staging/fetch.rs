use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::config::StagingConfig;
use crate::error::StagingError;
use crate::request::{AssetInput, AssetRef};
use crate::sanitize;

/// A reference resolved to a local file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedAsset {
    pub path: PathBuf,
    pub bytes: u64,
    pub mime: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff: Duration,
    pub max_bytes: u64,
}

impl From<&StagingConfig> for FetchPolicy {
    fn from(config: &StagingConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.fetch_timeout_secs),
            max_attempts: config.max_retries.max(1),
            backoff: Duration::from_millis(config.retry_backoff_ms),
            max_bytes: config.max_asset_bytes,
        }
    }
}

/// Resolves asset references into files inside a job workspace.
pub struct AssetFetcher {
    client: reqwest::Client,
    policy: FetchPolicy,
}

impl AssetFetcher {
    pub fn new(policy: FetchPolicy) -> Self {
        let client = reqwest::Client::builder()
            .timeout(policy.timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self { client, policy }
    }

    /// Stages `input` as `<dir>/<name>[.<ext>]`. Volume paths are used in
    /// place and never copied. When the input carries a checksum the staged
    /// content must match it.
    pub async fn stage(
        &self,
        input: &AssetInput,
        dir: &Path,
        name: &str,
    ) -> Result<StagedAsset, StagingError> {
        let expected = input.checksum_sha256.as_deref();
        let (asset, actual) = match &input.source {
            AssetRef::Url(url) => self.download(url, dir, name, expected.is_some()).await?,
            AssetRef::Inline { mime, bytes } => {
                let asset = write_inline(mime.as_deref(), bytes, dir, name).await?;
                let digest = expected.map(|_| hex_digest(Sha256::digest(bytes)));
                (asset, digest)
            }
            AssetRef::Path(path) => {
                let meta = tokio::fs::metadata(path)
                    .await
                    .map_err(|_| StagingError::MissingFile(path.clone()))?;
                if !meta.is_file() {
                    return Err(StagingError::MissingFile(path.clone()));
                }
                let digest = match expected {
                    Some(_) => Some(file_digest(path).await?),
                    None => None,
                };
                let asset = StagedAsset {
                    path: path.clone(),
                    bytes: meta.len(),
                    mime: mime_guess::from_path(path).first().map(|m| m.to_string()),
                };
                (asset, digest)
            }
        };

        if let (Some(expected), Some(actual)) = (expected, actual) {
            if expected != actual {
                return Err(StagingError::ChecksumMismatch {
                    reference: input.source.describe(),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        Ok(asset)
    }

    async fn download(
        &self,
        url: &str,
        dir: &Path,
        name: &str,
        hash: bool,
    ) -> Result<(StagedAsset, Option<String>), StagingError> {
        let mut attempt = 1;
        loop {
            match self.download_once(url, dir, name, hash).await {
                Ok((asset, digest)) => {
                    debug!(
                        "Fetched {} ({} bytes) on attempt {}",
                        sanitize::redact_url(url),
                        asset.bytes,
                        attempt
                    );
                    return Ok((asset, digest));
                }
                Err(e) if attempt < self.policy.max_attempts && is_retryable(&e) => {
                    warn!(
                        "Fetch attempt {}/{} failed: {}",
                        attempt, self.policy.max_attempts, e
                    );
                    tokio::time::sleep(self.policy.backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn download_once(
        &self,
        url: &str,
        dir: &Path,
        name: &str,
        hash: bool,
    ) -> Result<(StagedAsset, Option<String>), StagingError> {
        let shown = sanitize::redact_url(url);
        let fetch_error = |status: Option<u16>, message: String| StagingError::Fetch {
            reference: shown.clone(),
            status,
            message,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_error(None, e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(fetch_error(
                Some(status.as_u16()),
                format!("HTTP {}", status),
            ));
        }

        if let Some(len) = response.content_length() {
            if len > self.policy.max_bytes {
                return Err(StagingError::TooLarge {
                    reference: shown.clone(),
                    limit: self.policy.max_bytes,
                });
            }
        }

        let header_mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(normalize_mime)
            .filter(|m| !m.is_empty() && m != "application/octet-stream");
        let url_path = url.split(['?', '#']).next().unwrap_or(url);
        let mime =
            header_mime.or_else(|| mime_guess::from_path(url_path).first().map(|m| m.to_string()));

        let path = dir.join(file_name(name, mime.as_deref()));
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| StagingError::Write {
                path: path.clone(),
                source: e,
            })?;

        let mut written: u64 = 0;
        let mut hasher = hash.then(Sha256::new);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| fetch_error(None, e.without_url().to_string()))?;
            written += chunk.len() as u64;
            if written > self.policy.max_bytes {
                drop(file);
                let _ = tokio::fs::remove_file(&path).await;
                return Err(StagingError::TooLarge {
                    reference: shown.clone(),
                    limit: self.policy.max_bytes,
                });
            }
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&chunk);
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| StagingError::Write {
                    path: path.clone(),
                    source: e,
                })?;
        }
        file.flush().await.map_err(|e| StagingError::Write {
            path: path.clone(),
            source: e,
        })?;

        let asset = StagedAsset {
            path,
            bytes: written,
            mime,
        };
        Ok((asset, hasher.map(|h| hex_digest(h.finalize()))))
    }
}

fn hex_digest(digest: impl std::fmt::LowerHex) -> String {
    format!("{:x}", digest)
}

async fn file_digest(path: &Path) -> Result<String, StagingError> {
    let read_error = |_| StagingError::MissingFile(path.to_path_buf());
    let mut file = tokio::fs::File::open(path).await.map_err(read_error)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await.map_err(read_error)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_digest(hasher.finalize()))
}

fn is_retryable(err: &StagingError) -> bool {
    match err {
        StagingError::Fetch {
            status: Some(code), ..
        } => *code >= 500 || *code == 408 || *code == 429,
        StagingError::Fetch { status: None, .. } => true,
        _ => false,
    }
}

async fn write_inline(
    mime: Option<&str>,
    bytes: &[u8],
    dir: &Path,
    name: &str,
) -> Result<StagedAsset, StagingError> {
    let mime = mime.map(normalize_mime).or_else(|| sniff_mime(bytes));
    let path = dir.join(file_name(name, mime.as_deref()));
    tokio::fs::write(&path, bytes)
        .await
        .map_err(|e| StagingError::Write {
            path: path.clone(),
            source: e,
        })?;
    Ok(StagedAsset {
        path,
        bytes: bytes.len() as u64,
        mime,
    })
}

fn normalize_mime(raw: &str) -> String {
    raw.split(';').next().unwrap_or("").trim().to_ascii_lowercase()
}

/// Best-effort type detection for payloads that arrive without a MIME type.
fn sniff_mime(bytes: &[u8]) -> Option<String> {
    if let Ok(format) = image::guess_format(bytes) {
        return Some(format.to_mime_type().to_string());
    }
    if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
        return Some("audio/wav".to_string());
    }
    if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
        return Some("video/mp4".to_string());
    }
    if bytes.starts_with(b"ID3") || bytes.starts_with(&[0xFF, 0xFB]) {
        return Some("audio/mpeg".to_string());
    }
    None
}

/// File extension for a MIME type, preferring the conventional spelling.
pub fn extension_for(mime: &str) -> Option<&'static str> {
    match mime {
        "image/jpeg" => Some("jpg"),
        "audio/wav" | "audio/x-wav" | "audio/wave" => Some("wav"),
        "audio/mpeg" | "audio/mp3" => Some("mp3"),
        "video/quicktime" => Some("mov"),
        other => mime_guess::get_mime_extensions_str(other).and_then(|exts| exts.first().copied()),
    }
}

fn file_name(name: &str, mime: Option<&str>) -> String {
    match mime.and_then(extension_for) {
        Some(ext) => format!("{}.{}", name, ext),
        None => name.to_string(),
    }
}
