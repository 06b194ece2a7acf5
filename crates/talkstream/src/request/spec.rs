//! Normalized job specification produced by the validator.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::reference::AssetInput;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeBucket {
    Low,
    High,
}

impl SizeBucket {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "low" | "480" | "infinitetalk-480" => Some(SizeBucket::Low),
            "high" | "720" | "infinitetalk-720" => Some(SizeBucket::High),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SizeBucket::Low => "low",
            SizeBucket::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationMode {
    Clip,
    Streaming { max_frame_count: u32 },
}

impl GenerationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationMode::Clip => "clip",
            GenerationMode::Streaming { .. } => "streaming",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MixingMode {
    /// Both speakers' audio overlaid.
    Parallel,
    /// Speaker two follows speaker one.
    Concatenated,
}

impl MixingMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "parallel" | "para" => Some(MixingMode::Parallel),
            "concatenated" | "add" => Some(MixingMode::Concatenated),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MixingMode::Parallel => "parallel",
            MixingMode::Concatenated => "concatenated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakerMix {
    Solo,
    Duet(MixingMode),
}

impl SpeakerMix {
    pub fn speaker_count(&self) -> usize {
        match self {
            SpeakerMix::Solo => 1,
            SpeakerMix::Duet(_) => 2,
        }
    }

    pub fn mixing_mode(&self) -> Option<MixingMode> {
        match self {
            SpeakerMix::Solo => None,
            SpeakerMix::Duet(mode) => Some(*mode),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtsDirective {
    pub text: String,
    pub voice1: Option<String>,
    pub voice2: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioSource {
    Recorded {
        person1: AssetInput,
        person2: Option<AssetInput>,
    },
    Synthesized(TtsDirective),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x1: i64,
    pub y1: i64,
    pub x2: i64,
    pub y2: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SamplingParams {
    pub steps: u32,
    pub text_guidance: f32,
    pub audio_guidance: f32,
    pub seed: u64,
    pub color_correction: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TeaCache {
    pub enabled: bool,
    pub threshold: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Apg {
    pub enabled: bool,
    pub momentum: f32,
    pub norm_threshold: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Acceleration {
    pub teacache: TeaCache,
    pub apg: Apg,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VramPolicy {
    pub persistent_params: Option<u64>,
    pub offload: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantKind {
    Int8,
    Fp8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Quantization {
    pub kind: QuantKind,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputTarget {
    ObjectStore,
    Volume,
    Inline,
}

impl OutputTarget {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "object_store" | "s3" => Some(OutputTarget::ObjectStore),
            "volume" => Some(OutputTarget::Volume),
            "inline" => Some(OutputTarget::Inline),
            _ => None,
        }
    }
}

/// Caller-signed upload URLs from `output_config`. Artifacts with a URL are
/// PUT there; the rest go through the job's output target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresignedOutput {
    pub video_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub metadata_url: Option<String>,
}

impl PresignedOutput {
    /// Every artifact has a signed destination.
    pub fn covers_all(&self) -> bool {
        self.video_url.is_some() && self.thumbnail_url.is_some() && self.metadata_url.is_some()
    }
}

/// A fully validated single job. Downstream stages never see raw payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub visual_reference: AssetInput,
    pub audio: AudioSource,
    pub speakers: SpeakerMix,
    pub bbox: Option<BoundingBox>,
    pub size: SizeBucket,
    pub mode: GenerationMode,
    pub frame_count: u32,
    pub motion_window: u32,
    pub sampling: SamplingParams,
    pub acceleration: Acceleration,
    pub vram: VramPolicy,
    pub quantization: Option<Quantization>,
    pub output_target: OutputTarget,
    pub presigned: Option<PresignedOutput>,
}

impl JobSpec {
    /// Deterministic artifact stem derived from the key parameters.
    pub fn save_name(&self) -> String {
        format!(
            "talk_{}_{}_seed{}",
            self.size.as_str(),
            self.sampling.steps,
            self.sampling.seed
        )
    }

    /// Upper bound on frames this job may produce.
    pub fn frame_ceiling(&self) -> u32 {
        match self.mode {
            GenerationMode::Clip => self.frame_count,
            GenerationMode::Streaming { max_frame_count } => max_frame_count,
        }
    }

    /// Key parameters echoed back in results and metadata.
    pub fn echo_params(&self) -> Value {
        let max_frame_count = match self.mode {
            GenerationMode::Clip => Value::Null,
            GenerationMode::Streaming { max_frame_count } => json!(max_frame_count),
        };
        json!({
            "size": self.size.as_str(),
            "mode": self.mode.as_str(),
            "frame_count": self.frame_count,
            "max_frame_count": max_frame_count,
            "sampling_steps": self.sampling.steps,
            "text_guidance": self.sampling.text_guidance,
            "audio_guidance": self.sampling.audio_guidance,
            "motion_window": self.motion_window,
            "color_correction": self.sampling.color_correction,
            "teacache": self.acceleration.teacache,
            "apg": self.acceleration.apg,
            "seed": self.sampling.seed,
            "speakers": self.speakers.speaker_count(),
            "mixing_mode": self.speakers.mixing_mode().map(|m| m.as_str()),
            "quantization": self.quantization.as_ref().map(|q| q.kind),
        })
    }
}
