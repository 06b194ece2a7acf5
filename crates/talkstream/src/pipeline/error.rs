use thiserror::Error;

use crate::error::{
    EmbeddingError, EngineError, MuxError, StagingError, StoreError, ValidationError,
};
use crate::job::TransitionError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("Staging failed: {0}")]
    Staging(#[from] StagingError),

    #[error("Embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("{0}")]
    Engine(#[from] EngineError),

    #[error("Muxing failed: {0}")]
    Mux(#[from] MuxError),

    #[error("Upload failed: {0}")]
    Store(#[from] StoreError),

    #[error("Deadline exceeded after {elapsed_ms} ms (budget {budget_ms} ms)")]
    DeadlineExceeded { elapsed_ms: u64, budget_ms: u64 },

    #[error("Remaining budget of {remaining_ms} ms cannot cover another chunk (~{needed_ms} ms)")]
    InsufficientBudget { remaining_ms: u64, needed_ms: u64 },

    #[error("Pipeline state error: {0}")]
    Transition(#[from] TransitionError),

    #[error("Pipeline state error: {0} is not available")]
    MissingState(&'static str),
}

/// Non-fatal problems surfaced in the success result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineWarning {
    InlineOutput { bytes: u64 },
    WorkspaceCleanup { error: String },
    ChunkTruncated { produced: u32, ceiling: u32 },
}

impl std::fmt::Display for PipelineWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineWarning::InlineOutput { bytes } => write!(
                f,
                "Returning {} bytes of inline base64 output; prefer object_store for large videos",
                bytes
            ),
            PipelineWarning::WorkspaceCleanup { error } => {
                write!(f, "Workspace cleanup failed: {}", error)
            }
            PipelineWarning::ChunkTruncated { produced, ceiling } => write!(
                f,
                "Generation stopped at the {} frame ceiling ({} frames produced)",
                ceiling, produced
            ),
        }
    }
}
