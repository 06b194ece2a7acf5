//! Failure taxonomy: maps pipeline errors to a stable code, retry policy and
//! cause class.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, MuxError, StagingError, StoreError};
use crate::job::{ErrorCause, ErrorRecord, Stage};
use crate::sanitize;

use super::error::PipelineError;

const DETAIL_MAX_CHARS: usize = 240;

const OOM_MARKERS: &[&str] = &[
    "out of memory",
    "outofmemory",
    "cuda_error_out_of_memory",
    "cublas_status_alloc_failed",
    "resource exhausted",
];

const TRANSIENT_TOOL_MARKERS: &[&str] = &[
    "resource temporarily unavailable",
    "cannot allocate memory",
    "broken pipe",
    "interrupted system call",
    "timed out",
    "connection reset",
    "no space left on device",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InputValidation,
    DownloadFailed,
    EmbeddingFailed,
    EngineLoadFailed,
    OutOfMemory,
    MuxFailed,
    GenerationRuntime,
    UploadFailed,
    Timeout,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InputValidation => "INPUT_VALIDATION",
            ErrorCode::DownloadFailed => "DOWNLOAD_FAILED",
            ErrorCode::EmbeddingFailed => "EMBEDDING_FAILED",
            ErrorCode::EngineLoadFailed => "ENGINE_LOAD_FAILED",
            ErrorCode::OutOfMemory => "OUT_OF_MEMORY",
            ErrorCode::MuxFailed => "MUX_FAILED",
            ErrorCode::GenerationRuntime => "GENERATION_RUNTIME",
            ErrorCode::UploadFailed => "UPLOAD_FAILED",
            ErrorCode::Timeout => "TIMEOUT",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CauseClass {
    InvalidInput,
    Network,
    Filesystem,
    ModelLoad,
    ResourceExhausted,
    ToolFailure,
    Transient,
    Deadline,
    Internal,
}

pub fn classify(err: &PipelineError, stage: Stage) -> ErrorRecord {
    let (code, retryable, class) = match err {
        PipelineError::Validation(_) => (ErrorCode::InputValidation, false, CauseClass::InvalidInput),

        PipelineError::Staging(e) => {
            let (retryable, class) = match e {
                StagingError::Fetch { .. } => (true, CauseClass::Network),
                StagingError::TooLarge { .. } | StagingError::ChecksumMismatch { .. } => {
                    (false, CauseClass::InvalidInput)
                }
                StagingError::MissingFile(_) => (false, CauseClass::Filesystem),
                StagingError::Workspace { source, .. } | StagingError::Write { source, .. } => {
                    (io_is_transient(source), CauseClass::Filesystem)
                }
            };
            (ErrorCode::DownloadFailed, retryable, class)
        }

        PipelineError::Embedding(e) => {
            let class = match e {
                crate::error::EmbeddingError::ModelLoad(_) => CauseClass::ModelLoad,
                _ if e.is_transient() => CauseClass::Transient,
                _ => CauseClass::ToolFailure,
            };
            (ErrorCode::EmbeddingFailed, e.is_transient(), class)
        }

        PipelineError::Engine(e) => classify_engine(e, stage),

        PipelineError::Mux(e) => {
            let transient = mux_is_transient(e);
            let class = if transient {
                CauseClass::Transient
            } else {
                CauseClass::ToolFailure
            };
            (ErrorCode::MuxFailed, transient, class)
        }

        PipelineError::Store(e) => match e {
            StoreError::InlineTooLarge { .. }
            | StoreError::InvalidKey(_)
            | StoreError::Unconfigured(_) => {
                (ErrorCode::UploadFailed, false, CauseClass::InvalidInput)
            }
            StoreError::Http { .. } => (ErrorCode::UploadFailed, true, CauseClass::Network),
            StoreError::Write { .. } | StoreError::Read { .. } => {
                (ErrorCode::UploadFailed, true, CauseClass::Filesystem)
            }
        },

        PipelineError::DeadlineExceeded { .. } | PipelineError::InsufficientBudget { .. } => {
            (ErrorCode::Timeout, true, CauseClass::Deadline)
        }

        PipelineError::Transition(_) | PipelineError::MissingState(_) => {
            (ErrorCode::GenerationRuntime, false, CauseClass::Internal)
        }
    };

    let message = err.to_string();
    ErrorRecord {
        code,
        retryable,
        stage,
        cause: ErrorCause {
            class,
            detail: sanitize::excerpt(&root_detail(err), DETAIL_MAX_CHARS),
        },
        message: sanitize::excerpt(&message, DETAIL_MAX_CHARS * 2),
    }
}

fn classify_engine(err: &EngineError, stage: Stage) -> (ErrorCode, bool, CauseClass) {
    match err {
        EngineError::OutOfMemory(_) => {
            (ErrorCode::OutOfMemory, false, CauseClass::ResourceExhausted)
        }
        EngineError::Load(message) if is_oom(message) && stage == Stage::Generating => {
            (ErrorCode::OutOfMemory, false, CauseClass::ResourceExhausted)
        }
        EngineError::Load(_) => (ErrorCode::EngineLoadFailed, false, CauseClass::ModelLoad),
        EngineError::Disposed if stage <= Stage::Warmup => {
            (ErrorCode::EngineLoadFailed, false, CauseClass::ModelLoad)
        }
        EngineError::Disposed => (ErrorCode::GenerationRuntime, false, CauseClass::Internal),
        EngineError::Runtime { message, .. } if is_oom(message) => {
            (ErrorCode::OutOfMemory, false, CauseClass::ResourceExhausted)
        }
        EngineError::Runtime { transient, .. } => {
            let class = if *transient {
                CauseClass::Transient
            } else {
                CauseClass::Internal
            };
            (ErrorCode::GenerationRuntime, *transient, class)
        }
        EngineError::Protocol(_) if stage == Stage::Warmup => {
            (ErrorCode::EngineLoadFailed, false, CauseClass::ToolFailure)
        }
        EngineError::Protocol(_) => (ErrorCode::GenerationRuntime, true, CauseClass::ToolFailure),
    }
}

/// True when an engine message reports accelerator memory exhaustion.
pub fn is_oom(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    OOM_MARKERS.iter().any(|m| lower.contains(m))
}

fn mux_is_transient(err: &MuxError) -> bool {
    match err {
        MuxError::Exit { stderr, .. } => {
            let lower = stderr.to_ascii_lowercase();
            TRANSIENT_TOOL_MARKERS.iter().any(|m| lower.contains(m))
        }
        MuxError::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::WouldBlock
        ),
        MuxError::Spawn { .. } | MuxError::Thumbnail(_) | MuxError::NoFrames => false,
    }
}

/// Local I/O failures worth retrying elsewhere; a missing or forbidden
/// path fails the same way every time.
fn io_is_transient(err: &std::io::Error) -> bool {
    !matches!(
        err.kind(),
        std::io::ErrorKind::NotFound
            | std::io::ErrorKind::PermissionDenied
            | std::io::ErrorKind::InvalidInput
    )
}

/// Innermost error message in the source chain.
fn root_detail(err: &PipelineError) -> String {
    let mut current: &dyn std::error::Error = err;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EmbeddingError, ValidationError};

    #[test]
    fn test_validation_is_not_retryable() {
        let err = PipelineError::Validation(ValidationError::single("audio", "is required"));
        let record = classify(&err, Stage::Validating);
        assert_eq!(record.code, ErrorCode::InputValidation);
        assert!(!record.retryable);
        assert_eq!(record.stage, Stage::Validating);
        assert_eq!(record.cause.class, CauseClass::InvalidInput);
    }

    #[test]
    fn test_download_failure_is_retryable() {
        let err = PipelineError::Staging(StagingError::Fetch {
            reference: "https://example.com/a.png".to_string(),
            status: Some(404),
            message: "HTTP 404".to_string(),
        });
        let record = classify(&err, Stage::Staging);
        assert_eq!(record.code, ErrorCode::DownloadFailed);
        assert!(record.retryable);
        assert_eq!(record.cause.class, CauseClass::Network);
    }

    #[test]
    fn test_local_staging_failures_are_not_retryable() {
        let missing = PipelineError::Staging(StagingError::MissingFile("/in/a.wav".into()));
        let record = classify(&missing, Stage::Staging);
        assert_eq!(record.code, ErrorCode::DownloadFailed);
        assert!(!record.retryable);
        assert_eq!(record.cause.class, CauseClass::Filesystem);

        let mismatch = PipelineError::Staging(StagingError::ChecksumMismatch {
            reference: "https://example.com/a.png".to_string(),
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        });
        let record = classify(&mismatch, Stage::Staging);
        assert_eq!(record.code, ErrorCode::DownloadFailed);
        assert!(!record.retryable);
        assert_eq!(record.cause.class, CauseClass::InvalidInput);

        let no_root = PipelineError::Staging(StagingError::Workspace {
            path: "/missing/root".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        });
        assert!(!classify(&no_root, Stage::Staging).retryable);

        let disk = PipelineError::Staging(StagingError::Write {
            path: "/ws/in.png".into(),
            source: std::io::Error::other("no space left on device"),
        });
        assert!(classify(&disk, Stage::Staging).retryable);
    }

    #[test]
    fn test_embedding_retry_follows_transience() {
        let transient = PipelineError::Embedding(EmbeddingError::Synthesis {
            message: "busy".to_string(),
            transient: true,
        });
        assert!(classify(&transient, Stage::Embedding).retryable);

        let fatal = PipelineError::Embedding(EmbeddingError::ModelLoad("no weights".to_string()));
        let record = classify(&fatal, Stage::Embedding);
        assert_eq!(record.code, ErrorCode::EmbeddingFailed);
        assert!(!record.retryable);
        assert_eq!(record.cause.class, CauseClass::ModelLoad);
    }

    #[test]
    fn test_runtime_oom_message_maps_to_out_of_memory() {
        let err = PipelineError::Engine(EngineError::Runtime {
            message: "RuntimeError: CUDA out of memory. Tried to allocate 2.00 GiB".to_string(),
            transient: true,
        });
        let record = classify(&err, Stage::Generating);
        assert_eq!(record.code, ErrorCode::OutOfMemory);
        assert!(!record.retryable);
    }

    #[test]
    fn test_runtime_failure_retry_depends_on_cause() {
        let err = PipelineError::Engine(EngineError::Runtime {
            message: "NaN in latents".to_string(),
            transient: false,
        });
        let record = classify(&err, Stage::Generating);
        assert_eq!(record.code, ErrorCode::GenerationRuntime);
        assert!(!record.retryable);
    }

    #[test]
    fn test_engine_load_failure() {
        let err = PipelineError::Engine(EngineError::Load("missing checkpoint".to_string()));
        let record = classify(&err, Stage::Warmup);
        assert_eq!(record.code, ErrorCode::EngineLoadFailed);
        assert!(!record.retryable);
    }

    #[test]
    fn test_mux_transience_from_tool_output() {
        let transient = PipelineError::Mux(MuxError::Exit {
            status: "exit status: 1".to_string(),
            stderr: "av_interleaved_write_frame(): Resource temporarily unavailable".to_string(),
        });
        assert!(classify(&transient, Stage::Muxing).retryable);

        let fatal = PipelineError::Mux(MuxError::Exit {
            status: "exit status: 1".to_string(),
            stderr: "Unknown encoder 'libx264'".to_string(),
        });
        let record = classify(&fatal, Stage::Muxing);
        assert_eq!(record.code, ErrorCode::MuxFailed);
        assert!(!record.retryable);
    }

    #[test]
    fn test_timeouts_are_retryable() {
        let err = PipelineError::InsufficientBudget {
            remaining_ms: 100,
            needed_ms: 5000,
        };
        let record = classify(&err, Stage::Generating);
        assert_eq!(record.code, ErrorCode::Timeout);
        assert!(record.retryable);
    }

    #[test]
    fn test_upload_failure_is_retryable() {
        let err = PipelineError::Store(StoreError::Http {
            key: "talkstream/job/talk.mp4".to_string(),
            status: Some(503),
            message: "Service Unavailable".to_string(),
        });
        let record = classify(&err, Stage::Uploading);
        assert_eq!(record.code, ErrorCode::UploadFailed);
        assert!(record.retryable);
    }

    #[test]
    fn test_detail_is_bounded() {
        let err = PipelineError::Engine(EngineError::Protocol("x".repeat(5000)));
        let record = classify(&err, Stage::Generating);
        assert!(record.cause.detail.chars().count() <= DETAIL_MAX_CHARS + 1);
        assert!(record.message.chars().count() <= DETAIL_MAX_CHARS * 2 + 1);
    }

    #[test]
    fn test_error_code_wire_names() {
        assert_eq!(
            serde_json::to_value(ErrorCode::OutOfMemory).unwrap(),
            "OUT_OF_MEMORY"
        );
        assert_eq!(ErrorCode::InputValidation.to_string(), "INPUT_VALIDATION");
    }
}
