pub mod broadcast;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod job;
pub mod media;
pub mod pipeline;
pub mod request;
pub mod sanitize;
pub mod secrets;
pub mod staging;
pub mod storage;
pub mod telemetry;
pub mod worker;

pub use broadcast::{JobProgressBroadcaster, LogBroadcaster, ProgressEvent};
pub use config::{load_config, load_worker_config, WorkerConfig};
pub use engine::{EngineHandle, GenerationEngine};
pub use error::{
    ConfigError, EmbeddingError, EngineError, MuxError, Result, StagingError, StoreError,
    TalkError, ValidationError,
};
pub use job::{BatchReport, Job, JobOutcome, Stage};
pub use pipeline::{CancelFlag, Deadline, Pipeline, PipelineConfig, PipelineError};
pub use request::{validate_request, JobSpec, ValidatedRequest};
pub use telemetry::{init_tracing, JobLogger};
pub use worker::{Collaborators, JobEnvelope, Worker, WorkerResponse};
