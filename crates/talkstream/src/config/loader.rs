use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::schema::WorkerConfig;
use crate::error::ConfigError;

pub const CONFIG_PATH_ENV: &str = "TALKSTREAM_CONFIG";

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<WorkerConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<WorkerConfig, ConfigError> {
    let mut config: WorkerConfig = if content.trim().is_empty() {
        WorkerConfig::default()
    } else {
        serde_yaml::from_str(content)?
    };

    apply_env_overrides(&mut config)?;
    validate_config(&config)?;

    Ok(config)
}

/// Resolves the config path from `TALKSTREAM_CONFIG` or the given argument
/// and loads it. No path, or a path that does not exist, yields defaults.
pub fn load_worker_config(arg: Option<&str>) -> Result<WorkerConfig, ConfigError> {
    let path = std::env::var(CONFIG_PATH_ENV)
        .ok()
        .filter(|p| !p.is_empty())
        .or_else(|| arg.map(str::to_string))
        .map(PathBuf::from);

    match path {
        Some(path) if path.exists() => load_config(&path),
        Some(path) => {
            debug!("Config file {} not found, using defaults", path.display());
            load_config_from_str("")
        }
        None => load_config_from_str(""),
    }
}

pub fn apply_env_overrides(config: &mut WorkerConfig) -> Result<(), ConfigError> {
    if let Some(root) = env_value("TALKSTREAM_WORKSPACE_ROOT") {
        config.workspace_root = PathBuf::from(root);
    }
    if let Some(ffmpeg) = env_value("TALKSTREAM_FFMPEG") {
        config.media.ffmpeg_path = ffmpeg;
    }
    if let Some(prefix) = env_value("TALKSTREAM_OUTPUT_PREFIX") {
        config.output.prefix = prefix;
    }
    if let Some(secs) = env_value("TALKSTREAM_JOB_DEADLINE_SECS") {
        config.limits.job_deadline_secs =
            secs.parse().map_err(|_| ConfigError::Validation {
                message: format!("TALKSTREAM_JOB_DEADLINE_SECS is not a number: {}", secs),
            })?;
    }
    Ok(())
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

pub fn validate_config(config: &WorkerConfig) -> Result<(), ConfigError> {
    if config.limits.job_deadline_secs == 0 {
        return Err(ConfigError::Validation {
            message: "limits.job_deadline_secs must be positive".to_string(),
        });
    }

    if config.staging.max_concurrent_fetches == 0 {
        return Err(ConfigError::Validation {
            message: "staging.max_concurrent_fetches must be at least 1".to_string(),
        });
    }

    if config.staging.max_retries == 0 {
        return Err(ConfigError::Validation {
            message: "staging.max_retries must be at least 1".to_string(),
        });
    }

    if config.media.fps == 0 {
        return Err(ConfigError::Validation {
            message: "media.fps must be positive".to_string(),
        });
    }

    if config.output.prefix.contains("..") || config.output.prefix.starts_with('/') {
        return Err(ConfigError::Validation {
            message: format!(
                "output.prefix must be a relative key prefix: {}",
                config.output.prefix
            ),
        });
    }

    if config.output.presigned_timeout_secs == 0 {
        return Err(ConfigError::Validation {
            message: "output.presigned_timeout_secs must be positive".to_string(),
        });
    }

    if let Some(store) = &config.output.object_store {
        if !store.endpoint.starts_with("http://") && !store.endpoint.starts_with("https://") {
            return Err(ConfigError::Validation {
                message: format!(
                    "output.object_store.endpoint must be an http(s) URL: {}",
                    store.endpoint
                ),
            });
        }
        if store.bucket.trim().is_empty() {
            return Err(ConfigError::Validation {
                message: "output.object_store.bucket must not be empty".to_string(),
            });
        }
    }

    if config.progress.queue_capacity == 0 {
        return Err(ConfigError::Validation {
            message: "progress.queue_capacity must be at least 1".to_string(),
        });
    }

    for root in &config.staging.volume_roots {
        if !root.is_absolute() {
            return Err(ConfigError::Validation {
                message: format!(
                    "staging.volume_roots entries must be absolute: {}",
                    root.display()
                ),
            });
        }
    }

    Ok(())
}
