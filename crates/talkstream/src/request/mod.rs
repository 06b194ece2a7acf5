//! Job request model and validation.

pub mod reference;
pub mod spec;
pub mod validate;

pub use reference::{AssetInput, AssetRef};
pub use spec::{
    Acceleration, Apg, AudioSource, BoundingBox, GenerationMode, JobSpec, MixingMode,
    OutputTarget, PresignedOutput, QuantKind, Quantization, SamplingParams, SizeBucket,
    SpeakerMix, TeaCache, TtsDirective, VramPolicy,
};
pub use validate::{validate_request, BatchItemSpec, ValidatedRequest, ValidationContext};
