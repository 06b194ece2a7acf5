use std::time::Instant;

use crate::embedding::PreparedAudio;
use crate::engine::EngineLease;
use crate::job::{ArtifactDescriptor, ErrorRecord, Job, Timings};
use crate::media::FrameSpool;
use crate::staging::{StagedInputs, Workspace};
use crate::telemetry::JobLogger;

use super::cancel::{CancelFlag, Deadline};
use super::error::PipelineWarning;
use super::finalize::RenderedMedia;
use super::generation::GenerationSummary;
use super::progress::ProgressEmitter;

/// Everything one job accumulates while it moves through the stages.
pub struct JobRun {
    // Input
    pub job: Job,
    pub cancel: CancelFlag,
    pub deadline: Deadline,
    pub progress: ProgressEmitter,
    pub logger: JobLogger,

    // Staging; the workspace lives until completion or failure
    pub workspace: Option<Workspace>,
    pub staged: Option<StagedInputs>,

    // Embedding
    pub audio: Option<PreparedAudio>,

    // Warmup through Generating; dropping the lease frees the engine
    pub lease: Option<EngineLease>,
    pub cold_start: Option<bool>,

    // Generating
    pub spool: Option<FrameSpool>,
    pub generation: Option<GenerationSummary>,

    // Muxing
    pub rendered: Option<RenderedMedia>,

    // Uploading
    pub artifacts: Vec<ArtifactDescriptor>,

    pub timings: Timings,
    pub warnings: Vec<PipelineWarning>,
    pub excerpts: Vec<String>,
    pub error: Option<ErrorRecord>,
    pub started: Instant,
}

impl JobRun {
    pub fn new(
        job: Job,
        deadline: Deadline,
        cancel: CancelFlag,
        progress: ProgressEmitter,
        logger: JobLogger,
    ) -> Self {
        Self {
            job,
            cancel,
            deadline,
            progress,
            logger,
            workspace: None,
            staged: None,
            audio: None,
            lease: None,
            cold_start: None,
            spool: None,
            generation: None,
            rendered: None,
            artifacts: Vec::new(),
            timings: Timings::default(),
            warnings: Vec::new(),
            excerpts: Vec::new(),
            error: None,
            started: Instant::now(),
        }
    }

    /// Drops the engine lease, frame spool and workspace. Returns the
    /// workspace cleanup error, if any.
    pub fn release(&mut self) -> Option<std::io::Error> {
        self.lease = None;
        self.spool = None;
        self.rendered = None;
        self.workspace.take().and_then(|ws| ws.close().err())
    }
}
