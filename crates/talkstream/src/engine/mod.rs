//! Generation engine boundary: the conditioning handed to each chunk, the
//! state carried between chunks, and the process-wide engine handle.

pub mod handle;
pub mod sidecar;

use std::path::PathBuf;

use async_trait::async_trait;

use crate::embedding::SpeakerFeatures;
use crate::error::EngineError;
use crate::request::{
    Acceleration, BoundingBox, JobSpec, Quantization, SamplingParams, SizeBucket, VramPolicy,
};

pub use handle::{EngineHandle, EngineLease, EngineState};
pub use sidecar::{SidecarCommand, SidecarEngine};

/// One decoded video frame.
pub type Frame = image::RgbImage;

/// Everything the engine needs to render one chunk.
#[derive(Debug, Clone)]
pub struct Conditioning {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub visual: PathBuf,
    pub speakers: Vec<SpeakerFeatures>,
    pub bbox: Option<BoundingBox>,
    pub size: SizeBucket,
    pub frame_count: u32,
    pub motion_window: u32,
    pub sampling: SamplingParams,
    pub acceleration: Acceleration,
    pub vram: VramPolicy,
    pub quantization: Option<Quantization>,
    pub chunk_index: u32,
    /// Index of the first new frame this chunk contributes.
    pub start_frame: u32,
    /// Scratch directory for engine outputs.
    pub work_dir: PathBuf,
}

impl Conditioning {
    pub fn for_job(
        spec: &JobSpec,
        visual: PathBuf,
        speakers: Vec<SpeakerFeatures>,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            prompt: spec.prompt.clone(),
            negative_prompt: spec.negative_prompt.clone(),
            visual,
            speakers,
            bbox: spec.bbox,
            size: spec.size,
            frame_count: spec.frame_count,
            motion_window: spec.motion_window,
            sampling: spec.sampling,
            acceleration: spec.acceleration,
            vram: spec.vram,
            quantization: spec.quantization.clone(),
            chunk_index: 0,
            start_frame: 0,
            work_dir,
        }
    }

    pub fn at_chunk(&self, chunk_index: u32, start_frame: u32) -> Self {
        Self {
            chunk_index,
            start_frame,
            ..self.clone()
        }
    }
}

/// Trailing frames of one chunk, used to condition the next.
#[derive(Debug, Clone, PartialEq)]
pub struct CarriedState {
    pub source_chunk: u32,
    pub frames: Vec<Frame>,
}

impl CarriedState {
    /// Keeps the last `window` frames of `frames`.
    pub fn from_trailing(frames: &[Frame], window: usize, source_chunk: u32) -> Self {
        let start = frames.len().saturating_sub(window);
        Self {
            source_chunk,
            frames: frames[start..].to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ChunkOutput {
    pub frames: Vec<Frame>,
    /// The engine reached the natural end of the audio.
    pub is_final: bool,
}

/// Receives sampling-step progress while a chunk renders.
pub trait SamplingObserver: Send + Sync {
    fn on_step(&self, step: u32, total: u32);
}

#[async_trait]
pub trait GenerationEngine: Send + Sync {
    /// Loads weights onto the accelerator.
    async fn warmup(&self) -> Result<(), EngineError>;

    async fn generate_chunk(
        &self,
        conditioning: &Conditioning,
        carried: Option<&CarriedState>,
        observer: &dyn SamplingObserver,
    ) -> Result<ChunkOutput, EngineError>;

    async fn dispose(&self) -> Result<(), EngineError>;
}
