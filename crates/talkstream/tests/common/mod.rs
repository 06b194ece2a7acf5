#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use talkstream::embedding::{
    AudioTrack, FeatureExtractor, SpeakerFeatures, SpeechSynthesizer,
};
use talkstream::engine::{
    CarriedState, ChunkOutput, Conditioning, Frame, GenerationEngine, SamplingObserver,
};
use talkstream::error::{EmbeddingError, EngineError, MuxError};
use talkstream::media::{FrameSpool, MediaMuxer};
use talkstream::pipeline::{CancelFlag, DeliveryError, ProgressSink, StoreSet};
use talkstream::staging::Workspace;
use talkstream::storage::{FilesystemStore, ObjectStore};
use talkstream::{ProgressEvent, Worker, WorkerConfig};

pub const FRAME_EDGE: u32 = 4;

/// What one `generate_chunk` call looked like from the engine's side.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkCall {
    pub chunk_index: u32,
    pub start_frame: u32,
    pub carried_from: Option<u32>,
    pub carried_len: usize,
}

/// Engine that renders solid frames tagged with their global index.
#[derive(Default)]
pub struct ScriptedEngine {
    /// Zero-based call number that fails with an out-of-memory error.
    pub oom_on_call: Option<usize>,
    /// Streaming chunks report `is_final` once this many have been rendered.
    pub final_after: Option<u32>,
    /// Raised after the given chunk index finishes rendering.
    pub cancel_after: Option<(u32, CancelFlag)>,
    /// Wall-clock time each chunk takes to render.
    pub chunk_delay: Option<Duration>,
    pub warmups: AtomicUsize,
    pub disposals: AtomicUsize,
    pub calls: Mutex<Vec<ChunkCall>>,
}

impl ScriptedEngine {
    pub fn chunk_calls(&self) -> Vec<ChunkCall> {
        self.calls.lock().unwrap().clone()
    }
}

fn tagged_frame(index: u32) -> Frame {
    Frame::from_pixel(
        FRAME_EDGE,
        FRAME_EDGE,
        image::Rgb([(index % 256) as u8, (index / 256 % 256) as u8, 0]),
    )
}

#[async_trait]
impl GenerationEngine for ScriptedEngine {
    async fn warmup(&self) -> Result<(), EngineError> {
        self.warmups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn generate_chunk(
        &self,
        conditioning: &Conditioning,
        carried: Option<&CarriedState>,
        observer: &dyn SamplingObserver,
    ) -> Result<ChunkOutput, EngineError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(ChunkCall {
                chunk_index: conditioning.chunk_index,
                start_frame: conditioning.start_frame,
                carried_from: carried.map(|c| c.source_chunk),
                carried_len: carried.map(CarriedState::len).unwrap_or(0),
            });
            calls.len() - 1
        };
        if self.oom_on_call == Some(call) {
            return Err(EngineError::Runtime {
                message: "CUDA out of memory. Tried to allocate 2.00 GiB".to_string(),
                transient: false,
            });
        }

        if let Some(delay) = self.chunk_delay {
            tokio::time::sleep(delay).await;
        }

        let steps = conditioning.sampling.steps;
        for step in 1..=steps {
            observer.on_step(step, steps);
        }

        // Output starts with the carried overlap, as a real sampler's would.
        let carried_len = carried.map(CarriedState::len).unwrap_or(0) as u32;
        let first = conditioning.start_frame - carried_len;
        let frames = (first..first + conditioning.frame_count)
            .map(tagged_frame)
            .collect();

        let is_final = self
            .final_after
            .is_some_and(|n| conditioning.chunk_index + 1 >= n);
        if let Some((after, flag)) = &self.cancel_after {
            if conditioning.chunk_index == *after {
                flag.cancel();
            }
        }
        Ok(ChunkOutput { frames, is_final })
    }

    async fn dispose(&self) -> Result<(), EngineError> {
        self.disposals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Writes a small feature file per speaker.
pub struct FakeExtractor;

#[async_trait]
impl FeatureExtractor for FakeExtractor {
    async fn embed(
        &self,
        audio: &Path,
        speaker_index: usize,
        workspace: &Workspace,
    ) -> Result<SpeakerFeatures, EmbeddingError> {
        let path = workspace.file(&format!("speaker{}.features", speaker_index + 1));
        tokio::fs::write(&path, audio.display().to_string())
            .await
            .map_err(|e| EmbeddingError::Extraction {
                message: e.to_string(),
                transient: false,
            })?;
        Ok(SpeakerFeatures {
            speaker_index,
            path,
        })
    }
}

pub struct FakeSynthesizer;

#[async_trait]
impl SpeechSynthesizer for FakeSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        voice: Option<&str>,
        speaker_index: usize,
        workspace: &Workspace,
    ) -> Result<PathBuf, EmbeddingError> {
        let path = workspace.file(&format!("tts{}.wav", speaker_index + 1));
        let body = format!("{}|{}", voice.unwrap_or("default"), text);
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| EmbeddingError::Synthesis {
                message: e.to_string(),
                transient: false,
            })?;
        Ok(path)
    }
}

/// "Muxes" by copying the raw frame spool, so outputs stay deterministic.
pub struct CopyMuxer;

#[async_trait]
impl MediaMuxer for CopyMuxer {
    async fn mux(
        &self,
        frames: &FrameSpool,
        _audio: &AudioTrack,
        out: &Path,
    ) -> Result<PathBuf, MuxError> {
        if frames.is_empty() {
            return Err(MuxError::NoFrames);
        }
        tokio::fs::copy(frames.path(), out).await?;
        Ok(out.to_path_buf())
    }
}

/// Fails the way ffmpeg does when the encoder is missing.
pub struct FailingMuxer;

#[async_trait]
impl MediaMuxer for FailingMuxer {
    async fn mux(
        &self,
        _frames: &FrameSpool,
        _audio: &AudioTrack,
        _out: &Path,
    ) -> Result<PathBuf, MuxError> {
        Err(MuxError::Exit {
            status: "exit status: 1".to_string(),
            stderr: "Unknown encoder 'libx264'".to_string(),
        })
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn percents(&self) -> Vec<u8> {
        self.events().iter().map(|e| e.percent).collect()
    }

    pub fn stages(&self) -> Vec<String> {
        self.events().iter().map(|e| e.stage.clone()).collect()
    }
}

impl ProgressSink for RecordingSink {
    fn deliver(&self, event: &ProgressEvent) -> Result<(), DeliveryError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// A worker wired to scripted collaborators inside temp directories.
pub struct Harness {
    pub worker: Worker,
    pub engine: Arc<ScriptedEngine>,
    pub sink: Arc<RecordingSink>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new(engine: ScriptedEngine) -> Self {
        Self::with_muxer(engine, Arc::new(CopyMuxer))
    }

    pub fn with_muxer(engine: ScriptedEngine, muxer: Arc<dyn MediaMuxer>) -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("work")).unwrap();
        std::fs::write(dir.path().join("face.png"), b"not really a png").unwrap();
        std::fs::write(dir.path().join("one.wav"), b"RIFF speaker one").unwrap();
        std::fs::write(dir.path().join("two.wav"), b"RIFF speaker two").unwrap();

        let mut config = WorkerConfig::default();
        config.workspace_root = dir.path().join("work");
        config.engine.warm_on_start = false;
        config.staging.max_retries = 1;
        config.staging.fetch_timeout_secs = 5;

        let engine = Arc::new(engine);
        let volume: Arc<dyn ObjectStore> = Arc::new(FilesystemStore::new(dir.path().join("out")));
        let sink = Arc::new(RecordingSink::default());
        let worker = Worker::new(
            config,
            talkstream::Collaborators {
                engine: engine.clone(),
                extractor: Arc::new(FakeExtractor),
                synthesizer: Some(Arc::new(FakeSynthesizer)),
                muxer,
                stores: StoreSet {
                    volume: Some(volume),
                    ..Default::default()
                },
            },
        )
        .with_sink(sink.clone());

        Self {
            worker,
            engine,
            sink,
            dir,
        }
    }

    pub fn path(&self, name: &str) -> String {
        self.dir.path().join(name).display().to_string()
    }

    pub fn out_root(&self) -> PathBuf {
        self.dir.path().join("out")
    }

    /// Entries left under the workspace root.
    pub fn workspace_leftovers(&self) -> usize {
        std::fs::read_dir(self.dir.path().join("work"))
            .unwrap()
            .count()
    }

    /// A one-speaker clip request reading its inputs from the temp dir.
    pub fn clip_request(&self) -> Value {
        json!({
            "prompt": "A woman is talking to the camera",
            "visual_reference": self.path("face.png"),
            "audio": { "person1": self.path("one.wav") },
            "frame_count": 81,
            "sampling_steps": 8,
            "output_target": "volume"
        })
    }

    pub async fn run(&self, id: &str, input: Value) -> talkstream::WorkerResponse {
        self.worker
            .handle(json!({ "id": id, "input": input }), CancelFlag::new())
            .await
    }
}

pub fn with(mut payload: Value, key: &str, value: Value) -> Value {
    payload[key] = value;
    payload
}
