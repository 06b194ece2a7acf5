//! Per-speaker audio conditioning: optional speech synthesis followed by
//! feature extraction.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::EmbeddingError;
use crate::request::{AudioSource, JobSpec, MixingMode, SpeakerMix};
use crate::staging::{StagedInputs, Workspace};

/// Feature file produced for one speaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakerFeatures {
    pub speaker_index: usize,
    pub path: PathBuf,
}

/// Audio laid under the generated frames when muxing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioTrack {
    Single(PathBuf),
    Mixed {
        first: PathBuf,
        second: PathBuf,
        mode: MixingMode,
    },
}

impl AudioTrack {
    pub fn clips(&self) -> Vec<&Path> {
        match self {
            AudioTrack::Single(path) => vec![path.as_path()],
            AudioTrack::Mixed { first, second, .. } => vec![first.as_path(), second.as_path()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct PreparedAudio {
    pub speakers: Vec<SpeakerFeatures>,
    pub track: AudioTrack,
}

#[async_trait]
pub trait FeatureExtractor: Send + Sync {
    async fn embed(
        &self,
        audio: &Path,
        speaker_index: usize,
        workspace: &Workspace,
    ) -> Result<SpeakerFeatures, EmbeddingError>;
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Renders `text` in `voice` to an audio clip inside `workspace`.
    async fn synthesize(
        &self,
        text: &str,
        voice: Option<&str>,
        speaker_index: usize,
        workspace: &Workspace,
    ) -> Result<PathBuf, EmbeddingError>;
}

pub struct EmbeddingPreparer {
    extractor: Arc<dyn FeatureExtractor>,
    synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
}

impl EmbeddingPreparer {
    pub fn new(
        extractor: Arc<dyn FeatureExtractor>,
        synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    ) -> Self {
        Self {
            extractor,
            synthesizer,
        }
    }

    /// Produces speaker features and the mux track for a staged job.
    /// `on_speaker(done, total)` runs after each speaker is embedded.
    pub async fn prepare(
        &self,
        spec: &JobSpec,
        staged: &StagedInputs,
        workspace: &Workspace,
        on_speaker: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<PreparedAudio, EmbeddingError> {
        let clips = match &spec.audio {
            AudioSource::Recorded { .. } => staged.audio.iter().map(|a| a.path.clone()).collect(),
            AudioSource::Synthesized(tts) => {
                let synthesizer = self.synthesizer.as_ref().ok_or_else(|| {
                    EmbeddingError::ModelLoad("no speech synthesizer is configured".to_string())
                })?;
                let mut voices = vec![tts.voice1.as_deref()];
                if spec.speakers.speaker_count() == 2 {
                    voices.push(tts.voice2.as_deref());
                }
                let mut clips = Vec::with_capacity(voices.len());
                for (index, voice) in voices.into_iter().enumerate() {
                    let clip = synthesizer
                        .synthesize(&tts.text, voice, index, workspace)
                        .await?;
                    debug!("Synthesized speech for speaker {}", index + 1);
                    clips.push(clip);
                }
                clips
            }
        };

        let total = clips.len();
        if total != spec.speakers.speaker_count() {
            return Err(EmbeddingError::Extraction {
                message: format!(
                    "expected {} speaker clips, found {}",
                    spec.speakers.speaker_count(),
                    total
                ),
                transient: false,
            });
        }

        let mut speakers = Vec::with_capacity(total);
        for (index, clip) in clips.iter().enumerate() {
            speakers.push(self.extractor.embed(clip, index, workspace).await?);
            on_speaker(index + 1, total);
        }

        let track = match (spec.speakers, clips.as_slice()) {
            (SpeakerMix::Duet(mode), [first, second]) => AudioTrack::Mixed {
                first: first.clone(),
                second: second.clone(),
                mode,
            },
            (_, [first, ..]) => AudioTrack::Single(first.clone()),
            (_, []) => {
                return Err(EmbeddingError::Extraction {
                    message: "job has no audio".to_string(),
                    transient: false,
                })
            }
        };

        Ok(PreparedAudio { speakers, track })
    }
}
