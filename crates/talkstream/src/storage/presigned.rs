use std::time::Duration;

use tracing::{debug, warn};

use crate::error::StoreError;
use crate::sanitize;

/// Uploads artifacts with HTTP `PUT` to URLs the caller already signed.
#[derive(Clone, Default)]
pub struct PresignedUploader {
    client: reqwest::Client,
}

impl PresignedUploader {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self { client }
    }

    /// PUTs `bytes` to `url` and returns the unsigned object location.
    pub async fn put(&self, url: &str, bytes: Vec<u8>, mime: &str) -> Result<String, StoreError> {
        let shown = sanitize::redact_url(url);
        let size = bytes.len();

        let response = self
            .client
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, mime)
            .body(bytes)
            .send()
            .await
            .map_err(|e| StoreError::Http {
                key: shown.clone(),
                status: e.status().map(|s| s.as_u16()),
                message: e.without_url().to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Http {
                key: shown,
                status: Some(status.as_u16()),
                message: format!("HTTP {}: {}", status, sanitize::excerpt(&body, 200)),
            });
        }

        debug!("Uploaded {} bytes to {}", size, shown);
        Ok(unsigned_location(url))
    }
}

/// The URL without its query string. The signature grants write access and
/// must not leak into results.
pub fn unsigned_location(url: &str) -> String {
    url.split(['?', '#']).next().unwrap_or(url).to_string()
}

/// One-shot HTTP endpoint for exercising uploads without a real bucket.
#[cfg(test)]
pub(crate) mod testing {
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Accepts one request, answers with `status` and returns the request
    /// line, content type and body.
    pub(crate) async fn serve_once(
        status: u16,
    ) -> (String, tokio::task::JoinHandle<(String, String, Vec<u8>)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);

            let mut request_line = String::new();
            reader.read_line(&mut request_line).await.unwrap();
            let mut content_type = String::new();
            let mut length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                let line = line.trim_end();
                if line.is_empty() {
                    break;
                }
                if let Some((name, value)) = line.split_once(':') {
                    match name.to_ascii_lowercase().as_str() {
                        "content-length" => length = value.trim().parse().unwrap(),
                        "content-type" => content_type = value.trim().to_string(),
                        _ => {}
                    }
                }
            }
            let mut body = vec![0u8; length];
            reader.read_exact(&mut body).await.unwrap();

            let response = format!(
                "HTTP/1.1 {} X\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                status
            );
            reader.get_mut().write_all(response.as_bytes()).await.unwrap();
            (request_line.trim_end().to_string(), content_type, body)
        });
        (format!("http://{}", addr), task)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::serve_once;
    use super::*;

    #[test]
    fn test_unsigned_location_drops_signature() {
        assert_eq!(
            unsigned_location("https://bucket.example.com/a/b.mp4?X-Amz-Signature=abc"),
            "https://bucket.example.com/a/b.mp4"
        );
        assert_eq!(unsigned_location("https://h/a.mp4"), "https://h/a.mp4");
    }

    #[tokio::test]
    async fn test_put_sends_bytes_and_content_type() {
        let (base, server) = serve_once(200).await;
        let url = format!("{}/out/video.mp4?sig=secret", base);

        let location = PresignedUploader::new(Duration::from_secs(5))
            .put(&url, b"mp4 bytes".to_vec(), "video/mp4")
            .await
            .unwrap();
        assert_eq!(location, format!("{}/out/video.mp4", base));

        let (request_line, content_type, body) = server.await.unwrap();
        assert!(request_line.starts_with("PUT /out/video.mp4?sig=secret"));
        assert_eq!(content_type, "video/mp4");
        assert_eq!(body, b"mp4 bytes");
    }

    #[tokio::test]
    async fn test_rejected_upload_is_http_error_without_signature() {
        let (base, server) = serve_once(403).await;
        let url = format!("{}/out/video.mp4?sig=secret", base);

        let err = PresignedUploader::new(Duration::from_secs(5))
            .put(&url, b"x".to_vec(), "video/mp4")
            .await
            .unwrap_err();
        server.await.unwrap();
        match err {
            StoreError::Http { key, status, .. } => {
                assert_eq!(status, Some(403));
                assert!(!key.contains("secret"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
