use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::secrets::SecretSource;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    /// Payload defaults merged under every job request (request fields win).
    #[serde(default)]
    pub generation: Map<String, Value>,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub staging: StagingConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
}

fn default_workspace_root() -> PathBuf {
    std::env::temp_dir()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            generation: Map::new(),
            limits: LimitsConfig::default(),
            staging: StagingConfig::default(),
            engine: EngineConfig::default(),
            media: MediaConfig::default(),
            output: OutputConfig::default(),
            progress: ProgressConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Wall-clock budget for a job when the envelope carries no `deadline_ms`.
    #[serde(default = "default_job_deadline_secs")]
    pub job_deadline_secs: u64,
}

fn default_job_deadline_secs() -> u64 {
    3600
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            job_deadline_secs: default_job_deadline_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_asset_bytes")]
    pub max_asset_bytes: u64,
    /// Directories volume-path references must live under. Empty allows any path.
    #[serde(default)]
    pub volume_roots: Vec<PathBuf>,
}

fn default_max_concurrent_fetches() -> usize {
    num_cpus::get().clamp(2, 8)
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1500
}

fn default_max_asset_bytes() -> u64 {
    512 * 1024 * 1024
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: default_max_concurrent_fetches(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_asset_bytes: default_max_asset_bytes(),
            volume_roots: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Inference sidecar command line, program first.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub warm_on_start: bool,
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            env: HashMap::new(),
            warm_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_thumbnail_edge")]
    pub thumbnail_max_edge: u32,
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_fps() -> u32 {
    25
}

fn default_thumbnail_edge() -> u32 {
    480
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            fps: default_fps(),
            thumbnail_max_edge: default_thumbnail_edge(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub object_store: Option<ObjectStoreConfig>,
    #[serde(default)]
    pub volume_root: Option<PathBuf>,
    #[serde(default = "default_max_inline_bytes")]
    pub max_inline_bytes: u64,
    /// Timeout for uploads to caller-supplied presigned URLs.
    #[serde(default = "default_presigned_timeout_secs")]
    pub presigned_timeout_secs: u64,
}

fn default_prefix() -> String {
    "talkstream".to_string()
}

fn default_max_inline_bytes() -> u64 {
    8 * 1024 * 1024
}

fn default_presigned_timeout_secs() -> u64 {
    120
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            object_store: None,
            volume_root: None,
            max_inline_bytes: default_max_inline_bytes(),
            presigned_timeout_secs: default_presigned_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    /// Base URL objects are PUT under, e.g. `https://s3.eu-west-1.amazonaws.com`.
    pub endpoint: String,
    pub bucket: String,
    #[serde(default)]
    pub token: SecretSource,
    /// When set, returned locations use this base instead of the endpoint.
    #[serde(default)]
    pub public_base_url: Option<String>,
    #[serde(default = "default_upload_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_upload_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

fn default_queue_capacity() -> usize {
    64
}

fn default_broadcast_capacity() -> usize {
    256
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            webhook_url: None,
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}
