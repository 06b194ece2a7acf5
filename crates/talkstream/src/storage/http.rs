use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::config::ObjectStoreConfig;
use crate::error::{ConfigError, StoreError};
use crate::sanitize;

use super::{validate_key, ObjectStore};

/// Uploads artifacts with HTTP `PUT` to `<endpoint>/<bucket>/<key>`.
pub struct HttpObjectStore {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
    public_base_url: Option<String>,
    token: Option<SecretString>,
}

impl HttpObjectStore {
    pub fn from_config(config: &ObjectStoreConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ConfigError::Validation {
                message: format!("cannot build upload client: {}", e),
            })?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            bucket: config.bucket.trim_matches('/').to_string(),
            public_base_url: config
                .public_base_url
                .as_ref()
                .map(|u| u.trim_end_matches('/').to_string()),
            token: config.token.resolve_optional()?,
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, mime: &str) -> Result<String, StoreError> {
        validate_key(key)?;
        let url = self.object_url(key);
        let size = bytes.len();

        let mut request = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, mime)
            .body(bytes);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await.map_err(|e| StoreError::Http {
            key: key.to_string(),
            status: e.status().map(|s| s.as_u16()),
            message: e.without_url().to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Http {
                key: key.to_string(),
                status: Some(status.as_u16()),
                message: format!("HTTP {}: {}", status, sanitize::excerpt(&body, 200)),
            });
        }

        debug!("Uploaded {} bytes to {}", size, sanitize::redact_url(&url));
        self.public_url(key).await
    }

    async fn public_url(&self, key: &str) -> Result<String, StoreError> {
        validate_key(key)?;
        Ok(match &self.public_base_url {
            Some(base) => format!("{}/{}", base, key),
            None => self.object_url(key),
        })
    }
}
