//! Credential resolution for upload targets.
//!
//! A secret can be given inline (local testing), as a file (mounted secrets)
//! or as the name of an environment variable. Sources are tried in that order.

use std::fs;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("No secret source configured (need one of: value, file, env)")]
    NoSourceProvided,

    #[error("Failed to read secret from file '{path}': {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Environment variable '{name}' not set")]
    EnvVarNotSet { name: String },

    #[error("Environment variable '{name}' contains invalid UTF-8")]
    EnvVarNotUnicode { name: String },
}

/// Where to find a secret. All fields are optional; empty strings count as unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretSource {
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub env: Option<String>,
}

impl SecretSource {
    pub fn from_env(name: &str) -> Self {
        Self {
            env: Some(name.to_string()),
            ..Default::default()
        }
    }

    pub fn is_configured(&self) -> bool {
        [&self.value, &self.file, &self.env]
            .iter()
            .any(|s| s.as_deref().is_some_and(|s| !s.is_empty()))
    }

    pub fn resolve(&self) -> Result<SecretString, SecretError> {
        if let Some(value) = non_empty(&self.value) {
            return Ok(SecretString::from(value.to_string()));
        }

        if let Some(path) = non_empty(&self.file) {
            return fs::read_to_string(path)
                .map(|content| SecretString::from(content.trim().to_string()))
                .map_err(|e| SecretError::FileRead {
                    path: path.to_string(),
                    source: e,
                });
        }

        if let Some(name) = non_empty(&self.env) {
            return match std::env::var(name) {
                Ok(value) => Ok(SecretString::from(value.trim().to_string())),
                Err(std::env::VarError::NotPresent) => Err(SecretError::EnvVarNotSet {
                    name: name.to_string(),
                }),
                Err(std::env::VarError::NotUnicode(_)) => Err(SecretError::EnvVarNotUnicode {
                    name: name.to_string(),
                }),
            };
        }

        Err(SecretError::NoSourceProvided)
    }

    /// Like [`resolve`](Self::resolve) but an unconfigured source is `Ok(None)`.
    pub fn resolve_optional(&self) -> Result<Option<SecretString>, SecretError> {
        match self.resolve() {
            Ok(secret) => Ok(Some(secret)),
            Err(SecretError::NoSourceProvided) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_inline_value_wins() {
        let source = SecretSource {
            value: Some("direct".to_string()),
            file: Some("/nonexistent".to_string()),
            env: Some("TALKSTREAM_TEST_UNUSED".to_string()),
        };
        assert_eq!(source.resolve().unwrap().expose_secret(), "direct");
    }

    #[test]
    fn test_file_content_is_trimmed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "  from-file  ").unwrap();
        let source = SecretSource {
            file: Some(file.path().to_string_lossy().to_string()),
            ..Default::default()
        };
        assert_eq!(source.resolve().unwrap().expose_secret(), "from-file");
    }

    #[test]
    #[serial]
    fn test_env_fallback() {
        std::env::set_var("TALKSTREAM_TEST_TOKEN", "from-env\n");
        let source = SecretSource::from_env("TALKSTREAM_TEST_TOKEN");
        assert_eq!(source.resolve().unwrap().expose_secret(), "from-env");
        std::env::remove_var("TALKSTREAM_TEST_TOKEN");
    }

    #[test]
    #[serial]
    fn test_missing_env_var_is_an_error() {
        std::env::remove_var("TALKSTREAM_TEST_MISSING");
        let source = SecretSource::from_env("TALKSTREAM_TEST_MISSING");
        assert!(matches!(
            source.resolve(),
            Err(SecretError::EnvVarNotSet { .. })
        ));
    }

    #[test]
    fn test_unconfigured_source_is_optional() {
        let source = SecretSource {
            value: Some(String::new()),
            ..Default::default()
        };
        assert!(!source.is_configured());
        assert!(source.resolve_optional().unwrap().is_none());
    }
}
