pub mod batch;
pub mod cancel;
pub mod classify;
pub mod config;
pub mod context;
pub mod error;
pub mod finalize;
pub mod generation;
pub mod progress;
pub mod runner;

pub use batch::{run_batch, RunScope};
pub use cancel::{CancelFlag, Deadline};
pub use classify::{classify, CauseClass, ErrorCode};
pub use config::PipelineConfig;
pub use context::JobRun;
pub use error::{PipelineError, PipelineWarning};
pub use finalize::{ArtifactFinalizer, RenderedMedia, StoreSet};
pub use generation::{ChunkRecord, GenerationSummary};
pub use progress::{
    BroadcastSink, DeliveryError, DeliveryTarget, NoopSink, ProgressEmitter, ProgressSink,
    QueuedSink, WebhookTarget,
};
pub use runner::{rejected, Pipeline};
