//! Worker facade: owns the engine handle, progress sinks and pipeline, and
//! turns request envelopes into results.

pub mod envelope;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broadcast::{JobProgressBroadcaster, LogBroadcaster};
use crate::config::WorkerConfig;
use crate::embedding::{EmbeddingPreparer, FeatureExtractor, SpeechSynthesizer};
use crate::engine::{EngineHandle, GenerationEngine, SidecarCommand, SidecarEngine};
use crate::error::{ConfigError, TalkError};
use crate::job::Job;
use crate::media::{FfmpegMuxer, MediaMuxer};
use crate::pipeline::{
    rejected, run_batch, ArtifactFinalizer, BroadcastSink, CancelFlag, Deadline, Pipeline,
    PipelineConfig, ProgressSink, QueuedSink, RunScope, StoreSet, WebhookTarget,
};
use crate::request::{validate_request, ValidatedRequest, ValidationContext};
use crate::sanitize;
use crate::staging::ResourceStager;
use crate::storage::{FilesystemStore, HttpObjectStore, ObjectStore, PresignedUploader};
use crate::telemetry::JobLogger;

pub use envelope::{JobEnvelope, WorkerResponse};

/// External systems the worker drives.
pub struct Collaborators {
    pub engine: Arc<dyn GenerationEngine>,
    pub extractor: Arc<dyn FeatureExtractor>,
    pub synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    pub muxer: Arc<dyn MediaMuxer>,
    pub stores: StoreSet,
}

pub struct Worker {
    config: WorkerConfig,
    pipeline: Pipeline,
    engine: EngineHandle,
    sinks: Vec<Arc<dyn ProgressSink>>,
    progress: JobProgressBroadcaster,
    logs: LogBroadcaster,
    reporter: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn new(config: WorkerConfig, collaborators: Collaborators) -> Self {
        let pipeline_config = Arc::new(PipelineConfig::from_config(&config));
        let finalizer = ArtifactFinalizer::new(
            collaborators.muxer,
            collaborators.stores,
            pipeline_config.output_prefix.clone(),
            pipeline_config.max_inline_bytes,
            pipeline_config.fps,
            pipeline_config.thumbnail_max_edge,
        );
        let pipeline = Pipeline::new(
            pipeline_config,
            ResourceStager::from_config(&config.staging),
            EmbeddingPreparer::new(collaborators.extractor, collaborators.synthesizer),
            finalizer,
        );

        let progress = JobProgressBroadcaster::new(config.progress.broadcast_capacity);
        let sinks: Vec<Arc<dyn ProgressSink>> =
            vec![Arc::new(BroadcastSink::new(progress.clone()))];

        Self {
            config,
            pipeline,
            engine: EngineHandle::new(collaborators.engine),
            sinks,
            progress,
            logs: LogBroadcaster::default(),
            reporter: None,
        }
    }

    /// Production constructor: the inference sidecar serves as engine,
    /// feature extractor and speech synthesizer. Must be called inside a
    /// Tokio runtime when a progress webhook is configured.
    pub fn from_config(config: WorkerConfig) -> Result<Self, TalkError> {
        let command = SidecarCommand::from_config(&config.engine).ok_or_else(|| {
            ConfigError::Validation {
                message: "engine.command must name the inference sidecar".to_string(),
            }
        })?;
        let sidecar = Arc::new(SidecarEngine::new(command));

        let object_store = match &config.output.object_store {
            Some(store) => {
                Some(Arc::new(HttpObjectStore::from_config(store)?) as Arc<dyn ObjectStore>)
            }
            None => None,
        };
        let volume = config
            .output
            .volume_root
            .as_ref()
            .map(|root| Arc::new(FilesystemStore::new(root)) as Arc<dyn ObjectStore>);

        let collaborators = Collaborators {
            engine: sidecar.clone(),
            extractor: sidecar.clone(),
            synthesizer: Some(sidecar),
            muxer: Arc::new(FfmpegMuxer::from_config(&config.media)),
            stores: StoreSet {
                object_store,
                volume,
                presigned: PresignedUploader::new(Duration::from_secs(
                    config.output.presigned_timeout_secs,
                )),
            },
        };

        let webhook = config.progress.webhook_url.clone();
        let capacity = config.progress.queue_capacity;
        let mut worker = Self::new(config, collaborators);
        if let Some(url) = webhook {
            info!("Forwarding progress to {}", sanitize::redact_url(&url));
            let (sink, task) = QueuedSink::spawn(capacity, Arc::new(WebhookTarget::new(url)));
            worker.sinks.push(Arc::new(sink));
            worker.reporter = Some(task);
        }
        Ok(worker)
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    pub fn progress(&self) -> &JobProgressBroadcaster {
        &self.progress
    }

    pub fn logs(&self) -> &LogBroadcaster {
        &self.logs
    }

    /// Warms the engine up front when configured to; otherwise the first
    /// job pays for it in `Warmup`.
    pub async fn start(&self) -> Result<(), TalkError> {
        if self.config.engine.warm_on_start {
            let started = Instant::now();
            self.engine.init().await?;
            info!("Engine warm in {} ms", started.elapsed().as_millis());
        }
        Ok(())
    }

    /// Validates and runs one envelope. Never fails: every problem ends up
    /// in the returned result.
    pub async fn handle(&self, envelope: Value, cancel: CancelFlag) -> WorkerResponse {
        let started = Instant::now();
        let envelope = JobEnvelope::parse(envelope);
        let logger = JobLogger::new(&envelope.id).with_broadcaster(self.logs.clone());

        let ctx = ValidationContext {
            defaults: &self.config.generation,
            volume_roots: &self.config.staging.volume_roots,
        };
        let request = match validate_request(&envelope.input, ctx) {
            Ok(request) => request,
            Err(e) => {
                let mut details = Map::new();
                details.insert("violations".to_string(), Value::from(e.violations.len()));
                details.insert(
                    "message".to_string(),
                    Value::from(sanitize::excerpt(&e.to_string(), 400)),
                );
                logger.warn("request_rejected", details);
                return WorkerResponse::Single(rejected(&envelope.id, None, &e, started));
            }
        };

        let budget = envelope
            .deadline
            .unwrap_or(Duration::from_secs(self.config.limits.job_deadline_secs));
        let scope = RunScope {
            job_id: envelope.id.clone(),
            deadline: Deadline::new(budget),
            cancel,
            sinks: self.sinks.clone(),
            logger,
        };

        match request {
            ValidatedRequest::Single(spec) => {
                let job = Job::new(&envelope.id, envelope.input, spec);
                WorkerResponse::Single(self.pipeline.run(scope.run_for(job), &self.engine).await)
            }
            ValidatedRequest::Batch(items) => WorkerResponse::Batch(
                run_batch(&self.pipeline, &self.engine, &scope, &envelope.input, items).await,
            ),
        }
    }

    /// Disposes the engine and waits for queued progress to drain.
    pub async fn shutdown(mut self) -> Result<(), TalkError> {
        let disposed = self.engine.dispose().await;
        self.sinks.clear();
        if let Some(task) = self.reporter.take() {
            if let Err(e) = task.await {
                warn!("Progress reporter ended abnormally: {}", e);
            }
        }
        info!("Worker shut down");
        disposed.map_err(TalkError::from)
    }
}
