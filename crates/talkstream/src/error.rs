use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TalkError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid request: {0}")]
    Validation(#[from] ValidationError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Failed to resolve secret: {0}")]
    Secret(#[from] crate::secrets::SecretError),
}

/// A single rule broken by a request payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub field: String,
    pub message: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Error, Debug, Clone)]
#[error("{}", join_violations(.violations))]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

impl ValidationError {
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            violations: vec![Violation::new(field, message)],
        }
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.violations.iter().any(|v| v.field == field)
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum StagingError {
    #[error("Failed to prepare workspace '{path}': {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to fetch '{reference}': {message}")]
    Fetch {
        reference: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Asset '{reference}' exceeds the {limit} byte limit")]
    TooLarge { reference: String, limit: u64 },

    #[error("Volume asset not found: {0}")]
    MissingFile(PathBuf),

    #[error("Checksum mismatch for '{reference}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        reference: String,
        expected: String,
        actual: String,
    },

    #[error("Failed to write staged asset '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Speech synthesis failed: {message}")]
    Synthesis { message: String, transient: bool },

    #[error("Feature extraction failed: {message}")]
    Extraction { message: String, transient: bool },

    #[error("Audio model unavailable: {0}")]
    ModelLoad(String),
}

impl EmbeddingError {
    pub fn is_transient(&self) -> bool {
        match self {
            EmbeddingError::Synthesis { transient, .. }
            | EmbeddingError::Extraction { transient, .. } => *transient,
            EmbeddingError::ModelLoad(_) => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Engine failed to load: {0}")]
    Load(String),

    #[error("Accelerator out of memory: {0}")]
    OutOfMemory(String),

    #[error("Engine runtime failure: {message}")]
    Runtime { message: String, transient: bool },

    #[error("Engine has been disposed")]
    Disposed,

    #[error("Engine protocol error: {0}")]
    Protocol(String),
}

#[derive(Error, Debug)]
pub enum MuxError {
    #[error("Failed to launch muxer '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Muxer exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },

    #[error("Muxer I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Thumbnail encoding failed: {0}")]
    Thumbnail(String),

    #[error("No frames to mux")]
    NoFrames,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Upload of '{key}' failed: {message}")]
    Http {
        key: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Failed to write '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read artifact '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Inline output of {bytes} bytes exceeds the {limit} byte limit")]
    InlineTooLarge { bytes: u64, limit: u64 },

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("No store is configured for output target '{0}'")]
    Unconfigured(String),
}

pub type Result<T> = std::result::Result<T, TalkError>;
