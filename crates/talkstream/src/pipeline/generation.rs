//! Chunked generation. Each chunk is conditioned on the trailing
//! `motion_window` frames of the previous one; the loop threads that state
//! through an explicit [`ChunkFold`] accumulator.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::engine::{CarriedState, ChunkOutput, Conditioning, EngineLease, Frame, SamplingObserver};
use crate::error::{EngineError, MuxError};
use crate::media::FrameSpool;
use crate::request::{GenerationMode, JobSpec};

use super::cancel::{CancelFlag, Deadline};
use super::error::PipelineError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkRecord {
    pub index: u32,
    /// Half-open range of output frames this chunk contributed.
    pub frame_range: (u32, u32),
    /// Frames of conditioning carried in from the previous chunk.
    pub carried_frames: usize,
    pub latency_ms: u64,
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationSummary {
    pub chunks: Vec<ChunkRecord>,
    pub frames: u32,
    pub truncated: bool,
}

/// Sampling progress of the chunk loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkProgress {
    pub chunk_index: u32,
    pub step: u32,
    pub total_steps: u32,
    /// Overall fraction of generation done, in `[0, 1]`.
    pub fraction: f64,
}

/// Chunks the job is expected to need. Used only to scale progress.
pub fn expected_chunks(spec: &JobSpec) -> u32 {
    match spec.mode {
        GenerationMode::Clip => 1,
        GenerationMode::Streaming { max_frame_count } => {
            let stride = spec.frame_count.saturating_sub(spec.motion_window).max(1);
            let rest = max_frame_count.saturating_sub(spec.frame_count);
            1 + rest.div_ceil(stride)
        }
    }
}

/// Chunk loop accumulator: carried state, produced frames and the chunk log.
#[derive(Debug, Clone)]
pub struct ChunkFold {
    motion_window: usize,
    ceiling: u32,
    single_chunk: bool,
    carried: Option<CarriedState>,
    produced: u32,
    chunks: Vec<ChunkRecord>,
    slowest: Duration,
    finished: bool,
    truncated: bool,
}

impl ChunkFold {
    pub fn new(spec: &JobSpec) -> Self {
        Self {
            motion_window: spec.motion_window as usize,
            ceiling: spec.frame_ceiling(),
            single_chunk: matches!(spec.mode, GenerationMode::Clip),
            carried: None,
            produced: 0,
            chunks: Vec::new(),
            slowest: Duration::ZERO,
            finished: false,
            truncated: false,
        }
    }

    pub fn next_index(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn carried(&self) -> Option<&CarriedState> {
        self.carried.as_ref()
    }

    pub fn produced(&self) -> u32 {
        self.produced
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn slowest_chunk(&self) -> Duration {
        self.slowest
    }

    /// Folds one chunk's output in. Returns the accumulator for the next
    /// chunk and the frames that are new in this one (the overlap with the
    /// carried window is dropped, output past the ceiling is cut).
    pub fn fold(mut self, output: ChunkOutput, latency: Duration) -> Result<(Self, Vec<Frame>), EngineError> {
        let index = self.next_index();
        let carried_in = self.carried.as_ref().map(CarriedState::len).unwrap_or(0);
        let overlap = carried_in.min(output.frames.len());

        let mut fresh: Vec<Frame> = output.frames[overlap..].to_vec();
        if fresh.is_empty() && !output.is_final {
            return Err(EngineError::Protocol(format!(
                "chunk {} produced no new frames",
                index
            )));
        }

        let room = self.ceiling.saturating_sub(self.produced) as usize;
        if fresh.len() > room {
            fresh.truncate(room);
            self.truncated = true;
        }

        let start = self.produced;
        self.produced += fresh.len() as u32;
        self.carried = Some(CarriedState::from_trailing(
            &output.frames,
            self.motion_window,
            index,
        ));
        self.slowest = self.slowest.max(latency);
        self.finished = output.is_final || self.single_chunk || self.produced >= self.ceiling;
        self.chunks.push(ChunkRecord {
            index,
            frame_range: (start, self.produced),
            carried_frames: carried_in,
            latency_ms: latency.as_millis() as u64,
            is_final: output.is_final,
        });

        Ok((self, fresh))
    }

    pub fn into_summary(self) -> GenerationSummary {
        GenerationSummary {
            chunks: self.chunks,
            frames: self.produced,
            truncated: self.truncated,
        }
    }
}

pub enum GenerationOutcome {
    Finished(GenerationSummary),
    /// Cancellation was observed at a chunk boundary after `chunks_done` chunks.
    Cancelled { chunks_done: u32 },
}

struct ChunkObserver<'a> {
    chunk_index: u32,
    expected: u32,
    on_progress: &'a (dyn Fn(ChunkProgress) + Send + Sync),
}

impl SamplingObserver for ChunkObserver<'_> {
    fn on_step(&self, step: u32, total: u32) {
        let within = if total == 0 {
            1.0
        } else {
            f64::from(step.min(total)) / f64::from(total)
        };
        let expected = f64::from(self.expected.max(self.chunk_index + 1));
        (self.on_progress)(ChunkProgress {
            chunk_index: self.chunk_index,
            step,
            total_steps: total,
            fraction: ((f64::from(self.chunk_index) + within) / expected).min(1.0),
        });
    }
}

/// Runs the chunk loop to completion, cancellation or failure, appending new
/// frames to `spool`.
pub async fn generate(
    lease: &EngineLease,
    base: &Conditioning,
    spec: &JobSpec,
    spool: &mut FrameSpool,
    cancel: &CancelFlag,
    deadline: &Deadline,
    on_progress: &(dyn Fn(ChunkProgress) + Send + Sync),
) -> Result<GenerationOutcome, PipelineError> {
    let expected = expected_chunks(spec);
    let mut fold = ChunkFold::new(spec);

    while !fold.is_finished() {
        let index = fold.next_index();
        if index > 0 {
            if cancel.is_cancelled() {
                info!("Cancellation observed after chunk {}", index - 1);
                return Ok(GenerationOutcome::Cancelled { chunks_done: index });
            }
            deadline.ensure_remaining(fold.slowest_chunk())?;
        }

        let conditioning = base.at_chunk(index, fold.produced());
        let observer = ChunkObserver {
            chunk_index: index,
            expected,
            on_progress,
        };

        let started = Instant::now();
        let output = lease
            .generate_chunk(&conditioning, fold.carried(), &observer)
            .await?;
        let latency = started.elapsed();
        let is_final = output.is_final;

        let (next, fresh) = fold.fold(output, latency)?;
        fold = next;
        spool.append(&fresh).await.map_err(MuxError::Io)?;
        debug!(
            "Chunk {} added {} frames ({} total, final: {}) in {} ms",
            index,
            fresh.len(),
            fold.produced(),
            is_final,
            latency.as_millis()
        );
    }

    Ok(GenerationOutcome::Finished(fold.into_summary()))
}
