use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use tracing::{debug, info_span, warn, Instrument};

use crate::embedding::EmbeddingPreparer;
use crate::engine::{Conditioning, EngineHandle};
use crate::error::{MuxError, ValidationError};
use crate::job::{Checkpoint, Diagnostics, ErrorRecord, JobOutcome, JobStatus, Stage, StageEvent};
use crate::media::FrameSpool;
use crate::request::AudioSource;
use crate::sanitize;
use crate::staging::{ResourceStager, Workspace};

use super::classify::classify;
use super::config::PipelineConfig;
use super::context::JobRun;
use super::error::{PipelineError, PipelineWarning};
use super::finalize::{video_summary, ArtifactFinalizer};
use super::generation::{generate, ChunkProgress, GenerationOutcome};

const MAX_EXCERPTS: usize = 8;
const EXCERPT_MAX_CHARS: usize = 400;

/// Result of executing one stage body.
enum Step {
    Done(StageEvent),
    Cancelled,
}

pub struct Pipeline {
    config: Arc<PipelineConfig>,
    stager: ResourceStager,
    embedder: EmbeddingPreparer,
    finalizer: ArtifactFinalizer,
}

impl Pipeline {
    pub fn new(
        config: Arc<PipelineConfig>,
        stager: ResourceStager,
        embedder: EmbeddingPreparer,
        finalizer: ArtifactFinalizer,
    ) -> Self {
        Self {
            config,
            stager,
            embedder,
            finalizer,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn finalizer(&self) -> &ArtifactFinalizer {
        &self.finalizer
    }

    /// Runs the job until it reaches a terminal status.
    pub async fn run(&self, mut run: JobRun, engine: &EngineHandle) -> JobOutcome {
        let span = info_span!("job",
            job_id = %run.job.id,
            item_id = run.job.item_id().unwrap_or(""),
            correlation_id = %run.job.correlation_id,
        );

        async {
            run.logger.info("job_started", Map::new(), None);
            while !run.job.status().is_terminal() {
                if self.advance(&mut run, engine).await.is_err() {
                    break;
                }
            }
            self.outcome(run)
        }
        .instrument(span)
        .await
    }

    /// Executes exactly the stage after the run's current one.
    ///
    /// Terminal runs are not re-executed: a failed run returns its error
    /// again, a completed or cancelled run returns its last event. When
    /// cancellation is observed the run moves to `Cancelled` and the returned
    /// event carries a `cancelled` detail.
    pub async fn advance(
        &self,
        run: &mut JobRun,
        engine: &EngineHandle,
    ) -> Result<StageEvent, ErrorRecord> {
        let status = run.job.status();
        let next = match status {
            JobStatus::Failed { stage, .. } => {
                return Err(run.error.clone().unwrap_or_else(|| {
                    classify(&PipelineError::MissingState("error record"), stage)
                }))
            }
            JobStatus::Cancelled { stage } => return Ok(cancelled_event(run, stage)),
            JobStatus::Stage { stage } => match stage.next() {
                Some(next) => next,
                None => {
                    return Ok(run
                        .job
                        .events()
                        .last()
                        .cloned()
                        .unwrap_or_else(|| StageEvent::new(Stage::Completed, 100)))
                }
            },
        };

        if let Err(e) = run.job.transition(JobStatus::Stage { stage: next }) {
            return Err(self.fail(run, e.into()));
        }
        if run.cancel.is_cancelled() {
            return Ok(self.cancel(run));
        }
        if let Err(e) = run.deadline.check() {
            return Err(self.fail(run, e));
        }

        run.progress.advance(next, next.band().0, Map::new());
        let started = Instant::now();
        let span = info_span!("stage", stage = %next);
        let result = self.execute(next, run, engine).instrument(span).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        run.timings.record(next, latency_ms);

        match result {
            Ok(Step::Done(event)) => {
                let event = run.job.record(event.with_latency(latency_ms)).clone();
                run.progress
                    .advance(next, event.percent, event.details.clone());
                let mut details = event.details.clone();
                details.insert("stage".to_string(), Value::from(next.label()));
                details.insert("percent".to_string(), Value::from(event.percent));
                run.logger.info("stage_completed", details, Some(latency_ms));
                Ok(event)
            }
            Ok(Step::Cancelled) => Ok(self.cancel(run)),
            Err(e) => Err(self.fail(run, e)),
        }
    }

    async fn execute(
        &self,
        stage: Stage,
        run: &mut JobRun,
        engine: &EngineHandle,
    ) -> Result<Step, PipelineError> {
        match stage {
            Stage::Pending => Err(PipelineError::MissingState("pending stage body")),
            Stage::Validating => self.step_validate(run).map(Step::Done),
            Stage::Staging => self.step_stage(run).await.map(Step::Done),
            Stage::Embedding => self.step_embed(run).await.map(Step::Done),
            Stage::Warmup => self.step_warmup(run, engine).await.map(Step::Done),
            Stage::Generating => self.step_generate(run).await,
            Stage::Muxing => self.step_mux(run).await.map(Step::Done),
            Stage::Uploading => self.step_upload(run).await.map(Step::Done),
            Stage::Completed => Ok(Step::Done(self.step_complete(run))),
        }
    }

    /// The request itself was validated before the run was built; this checks
    /// it against what the worker can serve.
    fn step_validate(&self, run: &JobRun) -> Result<StageEvent, PipelineError> {
        let spec = &run.job.spec;
        if !self.finalizer.stores().serves(spec) {
            return Err(ValidationError::single(
                "output_target",
                "no store is configured for this output target",
            )
            .into());
        }
        Ok(StageEvent::new(Stage::Validating, 2)
            .with_detail("mode", spec.mode.as_str())
            .with_detail("speakers", spec.speakers.speaker_count())
            .with_detail("frame_ceiling", spec.frame_ceiling()))
    }

    async fn step_stage(&self, run: &mut JobRun) -> Result<StageEvent, PipelineError> {
        let workspace = Workspace::create(&self.config.workspace_root, &run.job.scoped_id())?;
        debug!(
            "Workspace {} created",
            sanitize::redact_path(workspace.path())
        );
        let workspace = run.workspace.insert(workspace);

        let progress = &run.progress;
        let mut on_staged = |done: usize, total: usize| {
            let mut details = Map::new();
            details.insert("assets_done".to_string(), Value::from(done));
            details.insert("assets_total".to_string(), Value::from(total));
            progress.advance(
                Stage::Staging,
                Stage::Staging.percent_at(done as f64 / total.max(1) as f64),
                details,
            );
        };
        let staged = self
            .stager
            .stage(&run.job.spec, workspace, &mut on_staged)
            .await?;

        let event = StageEvent::new(Stage::Staging, Stage::Staging.band().1)
            .with_detail("assets", 1 + staged.audio.len())
            .with_detail("bytes", staged.total_bytes());
        run.staged = Some(staged);
        Ok(event)
    }

    async fn step_embed(&self, run: &mut JobRun) -> Result<StageEvent, PipelineError> {
        let workspace = run
            .workspace
            .as_ref()
            .ok_or(PipelineError::MissingState("workspace"))?;
        let staged = run
            .staged
            .as_ref()
            .ok_or(PipelineError::MissingState("staged inputs"))?;

        let progress = &run.progress;
        let mut on_speaker = |done: usize, total: usize| {
            let mut details = Map::new();
            details.insert("speakers_done".to_string(), Value::from(done));
            progress.advance(
                Stage::Embedding,
                Stage::Embedding.percent_at(done as f64 / total.max(1) as f64),
                details,
            );
        };
        let audio = self
            .embedder
            .prepare(&run.job.spec, staged, workspace, &mut on_speaker)
            .await?;

        let event = StageEvent::new(Stage::Embedding, Stage::Embedding.band().1)
            .with_detail("speakers", audio.speakers.len())
            .with_detail(
                "synthesized",
                matches!(run.job.spec.audio, AudioSource::Synthesized(_)),
            );
        run.audio = Some(audio);
        Ok(event)
    }

    async fn step_warmup(
        &self,
        run: &mut JobRun,
        engine: &EngineHandle,
    ) -> Result<StageEvent, PipelineError> {
        let lease = match tokio::time::timeout(run.deadline.remaining(), engine.acquire()).await {
            Ok(lease) => lease?,
            Err(_) => {
                return Err(PipelineError::DeadlineExceeded {
                    elapsed_ms: run.deadline.elapsed().as_millis() as u64,
                    budget_ms: run.deadline.budget().as_millis() as u64,
                })
            }
        };
        let cold_start = lease.ensure_warm().await?;
        run.lease = Some(lease);
        run.cold_start = Some(cold_start);

        Ok(StageEvent::new(Stage::Warmup, 19).with_detail("cold_start", cold_start))
    }

    async fn step_generate(&self, run: &mut JobRun) -> Result<Step, PipelineError> {
        let workspace = run
            .workspace
            .as_ref()
            .ok_or(PipelineError::MissingState("workspace"))?;
        let staged = run
            .staged
            .as_ref()
            .ok_or(PipelineError::MissingState("staged inputs"))?;
        let audio = run
            .audio
            .as_ref()
            .ok_or(PipelineError::MissingState("speaker features"))?;

        let base = Conditioning::for_job(
            &run.job.spec,
            staged.visual.path.clone(),
            audio.speakers.clone(),
            workspace.subdir("chunks")?,
        );
        let spool = FrameSpool::create(workspace.file("frames.rgb"))
            .await
            .map_err(MuxError::Io)?;
        let spool = run.spool.insert(spool);
        let lease = run
            .lease
            .as_ref()
            .ok_or(PipelineError::MissingState("engine lease"))?;

        let progress = &run.progress;
        let on_progress = |p: ChunkProgress| {
            let mut details = Map::new();
            details.insert("chunk".to_string(), Value::from(p.chunk_index));
            details.insert("step".to_string(), Value::from(p.step));
            details.insert("total_steps".to_string(), Value::from(p.total_steps));
            progress.advance(
                Stage::Generating,
                Stage::Generating.percent_at(p.fraction),
                details,
            );
        };

        let outcome = generate(
            lease,
            &base,
            &run.job.spec,
            spool,
            &run.cancel,
            &run.deadline,
            &on_progress,
        )
        .await;
        // The engine is free for the next job once the last chunk is back.
        run.lease = None;

        let summary = match outcome? {
            GenerationOutcome::Finished(summary) => summary,
            GenerationOutcome::Cancelled { chunks_done } => {
                debug!("Discarding {} generated chunks", chunks_done);
                return Ok(Step::Cancelled);
            }
        };

        if let Some(spool) = run.spool.as_mut() {
            spool.finish().await.map_err(MuxError::Io)?;
        }
        if summary.truncated {
            run.warnings.push(PipelineWarning::ChunkTruncated {
                produced: summary.frames,
                ceiling: run.job.spec.frame_ceiling(),
            });
        }

        let event = StageEvent::new(Stage::Generating, Stage::Generating.band().1)
            .with_detail("chunks", summary.chunks.len())
            .with_detail("frames", summary.frames)
            .with_detail("truncated", summary.truncated);
        run.generation = Some(summary);
        Ok(Step::Done(event))
    }

    async fn step_mux(&self, run: &mut JobRun) -> Result<StageEvent, PipelineError> {
        let workspace = run
            .workspace
            .as_ref()
            .ok_or(PipelineError::MissingState("workspace"))?;
        let spool = run
            .spool
            .as_ref()
            .ok_or(PipelineError::MissingState("frame spool"))?;
        let audio = run
            .audio
            .as_ref()
            .ok_or(PipelineError::MissingState("audio track"))?;
        let summary = run
            .generation
            .as_ref()
            .ok_or(PipelineError::MissingState("generation summary"))?;

        let media = self
            .finalizer
            .render(&run.job, spool, &audio.track, summary, workspace)
            .await?;

        let event = StageEvent::new(Stage::Muxing, 90)
            .with_detail("frames", spool.len())
            .with_detail("thumbnail_bytes", media.thumbnail.len());
        run.rendered = Some(media);
        Ok(event)
    }

    async fn step_upload(&self, run: &mut JobRun) -> Result<StageEvent, PipelineError> {
        let media = run
            .rendered
            .as_ref()
            .ok_or(PipelineError::MissingState("rendered media"))?;
        let (artifacts, warnings) = self.finalizer.persist(&run.job, media).await?;

        for warning in &warnings {
            warn!("{}", warning);
        }
        run.warnings.extend(warnings);
        run.artifacts = artifacts;

        Ok(StageEvent::new(Stage::Uploading, 94)
            .with_detail("artifacts", run.artifacts.len())
            .with_detail(
                "target",
                serde_json::to_value(run.job.spec.output_target).unwrap_or(Value::Null),
            ))
    }

    fn step_complete(&self, run: &mut JobRun) -> StageEvent {
        if let Some(e) = run.release() {
            let mut details = Map::new();
            details.insert("error".to_string(), Value::from(e.to_string()));
            run.logger.warn("workspace_cleanup_failed", details);
            run.warnings.push(PipelineWarning::WorkspaceCleanup {
                error: e.to_string(),
            });
        }
        StageEvent::new(Stage::Completed, 100)
            .with_detail("artifacts", run.artifacts.len())
            .with_detail("warnings", run.warnings.len())
    }

    /// Classifies `err`, moves the run to `Failed` and releases its resources.
    fn fail(&self, run: &mut JobRun, err: PipelineError) -> ErrorRecord {
        let stage = run.job.status().stage();
        let record = classify(&err, stage);

        if let Some(e) = run.release() {
            debug!("Workspace cleanup after failure failed: {}", e);
        }
        if let Err(e) = run.job.transition(JobStatus::Failed {
            code: record.code,
            stage,
        }) {
            warn!("{}", e);
        }

        if run.excerpts.len() < MAX_EXCERPTS {
            run.excerpts
                .push(sanitize::excerpt(&err.to_string(), EXCERPT_MAX_CHARS));
        }

        let mut details = Map::new();
        details.insert("code".to_string(), Value::from(record.code.as_str()));
        details.insert("stage".to_string(), Value::from(stage.label()));
        details.insert("retryable".to_string(), Value::from(record.retryable));
        run.progress.emit_terminal("failed", details.clone());

        details.insert("message".to_string(), Value::from(record.message.clone()));
        run.logger.error(
            "job_failed",
            details,
            Some(run.started.elapsed().as_millis() as u64),
        );

        run.error = Some(record.clone());
        record
    }

    fn cancel(&self, run: &mut JobRun) -> StageEvent {
        let stage = run.job.status().stage();
        if let Some(e) = run.release() {
            debug!("Workspace cleanup after cancellation failed: {}", e);
        }
        if let Err(e) = run.job.transition(JobStatus::Cancelled { stage }) {
            warn!("{}", e);
        }

        let mut details = Map::new();
        details.insert("stage".to_string(), Value::from(stage.label()));
        run.progress.emit_terminal("cancelled", details.clone());
        run.logger.info(
            "job_cancelled",
            details,
            Some(run.started.elapsed().as_millis() as u64),
        );
        cancelled_event(run, stage)
    }

    fn outcome(&self, mut run: JobRun) -> JobOutcome {
        run.timings.total_ms = run.started.elapsed().as_millis() as u64;
        let job_id = run.job.id.clone();
        let item_id = run.job.item_id().map(str::to_string);

        match run.job.status() {
            JobStatus::Stage {
                stage: Stage::Completed,
            } => match video_summary(&run.artifacts) {
                Some(video) => {
                    let mut details = Map::new();
                    details.insert("location".to_string(), Value::from(video.location.clone()));
                    run.logger
                        .info("job_completed", details, Some(run.timings.total_ms));
                    JobOutcome::Success {
                        job_id,
                        item_id,
                        video,
                        artifacts: run.artifacts,
                        timings: run.timings,
                        params: run.job.spec.echo_params(),
                        warnings: run.warnings.iter().map(|w| w.to_string()).collect(),
                    }
                }
                None => self.error_outcome(
                    run,
                    classify(&PipelineError::MissingState("video artifact"), Stage::Completed),
                ),
            },
            JobStatus::Cancelled { stage } => JobOutcome::Cancelled {
                job_id,
                item_id,
                stage,
                timings: run.timings,
            },
            JobStatus::Failed { stage, .. } => {
                let error = run.error.clone().unwrap_or_else(|| {
                    classify(&PipelineError::MissingState("error record"), stage)
                });
                self.error_outcome(run, error)
            }
            JobStatus::Stage { stage } => self.error_outcome(
                run,
                classify(&PipelineError::MissingState("terminal status"), stage),
            ),
        }
    }

    fn error_outcome(&self, run: JobRun, error: ErrorRecord) -> JobOutcome {
        let checkpoints = run
            .job
            .events()
            .iter()
            .map(|e| Checkpoint {
                stage: e.stage,
                percent: e.percent,
                latency_ms: e.latency_ms,
            })
            .collect();
        JobOutcome::Error {
            job_id: run.job.id.clone(),
            item_id: run.job.item_id().map(str::to_string),
            error,
            diagnostics: Diagnostics {
                excerpts: run.excerpts,
                checkpoints,
            },
            timings: run.timings,
        }
    }
}

fn cancelled_event(run: &JobRun, stage: Stage) -> StageEvent {
    StageEvent::new(stage, run.progress.percent()).with_detail("cancelled", true)
}

/// Builds the error result for a request that never became a run.
pub fn rejected(
    job_id: &str,
    item_id: Option<&str>,
    err: &ValidationError,
    started: Instant,
) -> JobOutcome {
    let error = classify(&PipelineError::Validation(err.clone()), Stage::Validating);
    let excerpts = err
        .violations
        .iter()
        .take(MAX_EXCERPTS)
        .map(|v| sanitize::excerpt(&v.to_string(), EXCERPT_MAX_CHARS))
        .collect();
    let timings = crate::job::Timings {
        total_ms: started.elapsed().as_millis() as u64,
        ..Default::default()
    };
    JobOutcome::Error {
        job_id: job_id.to_string(),
        item_id: item_id.map(str::to_string),
        error,
        diagnostics: Diagnostics {
            excerpts,
            checkpoints: Vec::new(),
        },
        timings,
    }
}
