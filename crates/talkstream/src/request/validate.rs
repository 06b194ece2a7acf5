//! Pure request validation: raw JSON payload in, normalized `JobSpec` out.
//!
//! Every rule is checked and all violations are reported together. Nothing
//! here touches the network or the filesystem.

use std::collections::HashSet;
use std::path::PathBuf;

use serde_json::{Map, Value};

use crate::error::{ValidationError, Violation};

use super::reference::{parse_checksum, AssetInput, AssetRef};
use super::spec::{
    Acceleration, Apg, AudioSource, BoundingBox, GenerationMode, JobSpec, MixingMode,
    OutputTarget, PresignedOutput, QuantKind, Quantization, SamplingParams, SizeBucket,
    SpeakerMix, TeaCache, TtsDirective, VramPolicy,
};

const DEFAULT_FRAME_COUNT: i64 = 81;
const DEFAULT_MAX_FRAME_COUNT: i64 = 1000;
const DEFAULT_SAMPLING_STEPS: i64 = 40;
const DEFAULT_TEXT_GUIDANCE: f64 = 5.0;
const DEFAULT_AUDIO_GUIDANCE: f64 = 4.0;
const DEFAULT_MOTION_WINDOW: i64 = 9;
const DEFAULT_COLOR_CORRECTION: f64 = 1.0;
const DEFAULT_TEACACHE_THRESHOLD: f64 = 0.2;
const DEFAULT_APG_MOMENTUM: f64 = -0.75;
const DEFAULT_APG_NORM_THRESHOLD: f64 = 55.0;
const DEFAULT_SEED: i64 = 42;

/// Request fields that describe one specific job and are never taken from
/// configured defaults.
const PER_JOB_FIELDS: &[&str] = &[
    "prompt",
    "visual_reference",
    "audio",
    "mixing_mode",
    "bbox",
    "item_id",
    "output_config",
];

#[derive(Debug, Clone, PartialEq)]
pub enum ValidatedRequest {
    Single(JobSpec),
    Batch(Vec<BatchItemSpec>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchItemSpec {
    pub item_id: String,
    pub spec: JobSpec,
}

/// Validator inputs that come from worker configuration rather than the request.
#[derive(Debug, Clone, Copy)]
pub struct ValidationContext<'a> {
    pub defaults: &'a Map<String, Value>,
    pub volume_roots: &'a [PathBuf],
}

impl ValidationContext<'_> {
    pub fn empty() -> ValidationContext<'static> {
        static EMPTY: std::sync::OnceLock<Map<String, Value>> = std::sync::OnceLock::new();
        ValidationContext {
            defaults: EMPTY.get_or_init(Map::new),
            volume_roots: &[],
        }
    }
}

/// Validates a single job or a batch. A batch with any invalid item is
/// rejected as a whole, with every item's violations reported together.
pub fn validate_request(
    payload: &Value,
    ctx: ValidationContext<'_>,
) -> Result<ValidatedRequest, ValidationError> {
    let Some(obj) = payload.as_object() else {
        return Err(ValidationError::single("input", "must be a JSON object"));
    };

    let mut violations = Vec::new();

    let items_key = ["items", "batch"].into_iter().find(|k| obj.contains_key(*k));
    let result = match items_key {
        Some(key) => validate_batch(obj, key, ctx, &mut violations).map(ValidatedRequest::Batch),
        None => {
            let merged = merge_defaults(obj, ctx.defaults, None);
            validate_single(&merged, "", ctx, &mut violations).map(ValidatedRequest::Single)
        }
    };

    match result {
        Some(request) if violations.is_empty() => Ok(request),
        _ => Err(ValidationError { violations }),
    }
}

fn validate_batch(
    obj: &Map<String, Value>,
    key: &str,
    ctx: ValidationContext<'_>,
    violations: &mut Vec<Violation>,
) -> Option<Vec<BatchItemSpec>> {
    let Some(items) = obj.get(key).and_then(Value::as_array) else {
        violations.push(Violation::new(key, "must be an array of job objects"));
        return None;
    };
    if items.is_empty() {
        violations.push(Violation::new(key, "must contain at least one item"));
        return None;
    }

    let shared_target = match obj.get("shared_output_target") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if OutputTarget::parse(s).is_some() => {
            Some(Value::String(s.clone()))
        }
        Some(_) => {
            violations.push(Violation::new(
                "shared_output_target",
                "must be one of object_store, volume, inline",
            ));
            None
        }
    };

    let mut seen = HashSet::new();
    let mut specs = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let prefix = format!("{}[{}]", key, index);
        let Some(item_obj) = item.as_object() else {
            violations.push(Violation::new(prefix, "must be a JSON object"));
            continue;
        };

        let item_id = match item_obj.get("item_id") {
            Some(Value::String(id)) if !id.trim().is_empty() => id.trim().to_string(),
            None | Some(Value::Null) => format!("item-{}", index),
            Some(_) => {
                violations.push(Violation::new(
                    format!("{}.item_id", prefix),
                    "must be a non-empty string",
                ));
                format!("item-{}", index)
            }
        };
        if !seen.insert(item_id.clone()) {
            violations.push(Violation::new(
                format!("{}.item_id", prefix),
                format!("duplicate item id '{}'", item_id),
            ));
        }

        let merged = merge_defaults(item_obj, ctx.defaults, shared_target.as_ref());
        if let Some(spec) = validate_single(&merged, &prefix, ctx, violations) {
            specs.push(BatchItemSpec { item_id, spec });
        }
    }

    (specs.len() == items.len()).then_some(specs)
}

/// Layers `payload` over the configured defaults. `shared_target` fills
/// `output_target` when the payload has none.
fn merge_defaults(
    payload: &Map<String, Value>,
    defaults: &Map<String, Value>,
    shared_target: Option<&Value>,
) -> Map<String, Value> {
    let mut merged: Map<String, Value> = defaults
        .iter()
        .filter(|(k, _)| !PER_JOB_FIELDS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    if let Some(target) = shared_target {
        merged.insert("output_target".to_string(), target.clone());
    }

    for (key, value) in payload {
        if let (Some(Value::Object(base)), Value::Object(overlay)) = (merged.get_mut(key), value) {
            for (k, v) in overlay {
                base.insert(k.clone(), v.clone());
            }
            continue;
        }
        if !value.is_null() || !merged.contains_key(key) {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

fn validate_single(
    obj: &Map<String, Value>,
    prefix: &str,
    ctx: ValidationContext<'_>,
    violations: &mut Vec<Violation>,
) -> Option<JobSpec> {
    let before = violations.len();
    let mut r = FieldReader::new(obj, prefix, violations);

    let prompt = r.required_str("prompt");
    let negative_prompt = r.opt_str("negative_prompt").filter(|s| !s.trim().is_empty());
    let visual_reference = r.required_asset("visual_reference", ctx.volume_roots);

    let audio = read_audio(&mut r, ctx.volume_roots);
    let speaker_count = match &audio {
        Some(AudioSource::Recorded { person2, .. }) => 1 + usize::from(person2.is_some()),
        Some(AudioSource::Synthesized(tts)) => 1 + usize::from(tts.voice2.is_some()),
        None => 1,
    };

    let mixing_mode = r.opt_str("mixing_mode").and_then(|raw| match MixingMode::parse(&raw) {
        Some(mode) => Some(mode),
        None => {
            r.violation("mixing_mode", "must be one of parallel, concatenated");
            None
        }
    });
    let speakers = match (speaker_count, mixing_mode) {
        (2, Some(mode)) => SpeakerMix::Duet(mode),
        (2, None) => {
            if !r.has("mixing_mode") {
                r.violation("mixing_mode", "is required when two speakers are present");
            }
            SpeakerMix::Solo
        }
        (_, Some(_)) => {
            r.violation("mixing_mode", "is only allowed when two speakers are present");
            SpeakerMix::Solo
        }
        (_, None) => SpeakerMix::Solo,
    };

    let bbox = read_bbox(&mut r);

    let size = r.enum_str("size", "low", "low, high", SizeBucket::parse);
    let frame_count = r.int("frame_count", DEFAULT_FRAME_COUNT);
    if frame_count <= 0 || (frame_count - 1) % 4 != 0 {
        r.violation("frame_count", "must be positive and of the form 4n+1");
    }

    let mode_raw = r.enum_str(
        "mode",
        "clip",
        "clip, streaming",
        |s| matches!(s, "clip" | "streaming").then_some(s == "streaming"),
    );
    let max_frame_count = r.int("max_frame_count", DEFAULT_MAX_FRAME_COUNT);
    if mode_raw == Some(true) && max_frame_count < frame_count {
        r.violation("max_frame_count", "must be at least frame_count in streaming mode");
    }

    let steps = r.int("sampling_steps", DEFAULT_SAMPLING_STEPS);
    r.check_int_range("sampling_steps", steps, 1, 100);
    let text_guidance = r.float("text_guidance", DEFAULT_TEXT_GUIDANCE);
    r.check_float_range("text_guidance", text_guidance, 0.0, 20.0);
    let audio_guidance = r.float("audio_guidance", DEFAULT_AUDIO_GUIDANCE);
    r.check_float_range("audio_guidance", audio_guidance, 0.0, 20.0);

    let motion_window = r.int("motion_window", DEFAULT_MOTION_WINDOW);
    if motion_window < 1 || motion_window >= frame_count.max(1) {
        r.violation("motion_window", "must be at least 1 and less than frame_count");
    }

    let color_correction = r.float("color_correction", DEFAULT_COLOR_CORRECTION);
    r.check_float_range("color_correction", color_correction, 0.0, 1.0);

    let seed = r.int("seed", DEFAULT_SEED);
    if seed < 0 {
        r.violation("seed", "must not be negative");
    }

    let acceleration = read_acceleration(&mut r);
    let vram = read_vram_policy(&mut r);
    let quantization = read_quantization(&mut r);
    let output_target = r.enum_str(
        "output_target",
        "object_store",
        "object_store, volume, inline",
        OutputTarget::parse,
    );
    let presigned = read_output_config(&mut r);

    drop(r);
    if violations.len() > before {
        return None;
    }

    Some(JobSpec {
        prompt: prompt?,
        negative_prompt,
        visual_reference: visual_reference?,
        audio: audio?,
        speakers,
        bbox,
        size: size?,
        mode: if mode_raw? {
            GenerationMode::Streaming {
                max_frame_count: u32::try_from(max_frame_count).ok()?,
            }
        } else {
            GenerationMode::Clip
        },
        frame_count: u32::try_from(frame_count).ok()?,
        motion_window: u32::try_from(motion_window).ok()?,
        sampling: SamplingParams {
            steps: u32::try_from(steps).ok()?,
            text_guidance: text_guidance as f32,
            audio_guidance: audio_guidance as f32,
            seed: u64::try_from(seed).ok()?,
            color_correction: color_correction as f32,
        },
        acceleration,
        vram,
        quantization,
        output_target: output_target?,
        presigned,
    })
}

fn read_audio(r: &mut FieldReader<'_, '_>, volume_roots: &[PathBuf]) -> Option<AudioSource> {
    let Some(audio) = r.object("audio") else {
        if !r.has("audio") {
            r.violation("audio", "an audio source or a tts directive is required");
        }
        return None;
    };
    let mut a = r.nested(&audio, "audio");

    let has_recorded = a.has("person1") || a.has("person2");
    let tts = a.object("tts");

    match (has_recorded, tts) {
        (true, Some(_)) => {
            a.violation("tts", "cannot be combined with recorded audio");
            None
        }
        (false, Some(tts)) => {
            let mut t = a.nested(&tts, "tts");
            let text = t.required_str("text");
            let voice1 = t.opt_str("voice1");
            let voice2 = t.opt_str("voice2");
            Some(AudioSource::Synthesized(TtsDirective {
                text: text?,
                voice1,
                voice2,
            }))
        }
        (true, None) => {
            let person1 = a.required_asset("person1", volume_roots);
            let person2 = if a.has("person2") {
                Some(a.required_asset("person2", volume_roots)?)
            } else {
                None
            };
            Some(AudioSource::Recorded {
                person1: person1?,
                person2,
            })
        }
        (false, None) => {
            if !a.has("tts") {
                r.violation("audio", "an audio source or a tts directive is required");
            }
            None
        }
    }
}

fn read_bbox(r: &mut FieldReader<'_, '_>) -> Option<BoundingBox> {
    let value = r.get("bbox")?.clone();
    let coords: Option<Vec<i64>> = value
        .as_array()
        .filter(|a| a.len() == 4)
        .map(|a| a.iter().filter_map(Value::as_i64).collect())
        .filter(|c: &Vec<i64>| c.len() == 4);

    match coords.as_deref() {
        Some(&[x1, y1, x2, y2]) if x1 < x2 && y1 < y2 => Some(BoundingBox { x1, y1, x2, y2 }),
        Some(_) => {
            r.violation("bbox", "must satisfy x1 < x2 and y1 < y2");
            None
        }
        None => {
            r.violation("bbox", "must be an array of 4 integers [x1, y1, x2, y2]");
            None
        }
    }
}

fn read_acceleration(r: &mut FieldReader<'_, '_>) -> Acceleration {
    let teacache = r.object("teacache").unwrap_or_default();
    let mut t = r.nested(&teacache, "teacache");
    let teacache = TeaCache {
        enabled: t.boolean("enabled", false),
        threshold: t.float("threshold", DEFAULT_TEACACHE_THRESHOLD) as f32,
    };
    if !(teacache.threshold > 0.0 && teacache.threshold <= 1.0) {
        t.violation("threshold", "must be in (0, 1]");
    }

    let apg = r.object("apg").unwrap_or_default();
    let mut a = r.nested(&apg, "apg");
    let apg = Apg {
        enabled: a.boolean("enabled", false),
        momentum: a.float("momentum", DEFAULT_APG_MOMENTUM) as f32,
        norm_threshold: a.float("norm_threshold", DEFAULT_APG_NORM_THRESHOLD) as f32,
    };
    if apg.norm_threshold <= 0.0 {
        a.violation("norm_threshold", "must be positive");
    }

    Acceleration { teacache, apg }
}

fn read_vram_policy(r: &mut FieldReader<'_, '_>) -> VramPolicy {
    let Some(policy) = r.object("vram_policy") else {
        return VramPolicy::default();
    };
    let mut v = r.nested(&policy, "vram_policy");
    let persistent_params = v.opt_int("persistent_params").and_then(|n| {
        if n < 0 {
            v.violation("persistent_params", "must not be negative");
        }
        u64::try_from(n).ok()
    });
    let offload = v.opt_bool("offload");
    VramPolicy {
        persistent_params,
        offload,
    }
}

/// `output_config { video_url?, thumbnail_url?, metadata_url? }`: presigned
/// PUT destinations. Other keys are ignored.
fn read_output_config(r: &mut FieldReader<'_, '_>) -> Option<PresignedOutput> {
    let config = r.object("output_config")?;
    let mut c = r.nested(&config, "output_config");
    let mut url = |name: &str| {
        let raw = c.opt_str(name)?;
        match AssetRef::parse(&raw, &[]) {
            Ok(AssetRef::Url(url)) => Some(url),
            _ => {
                c.violation(name, "must be an http(s) URL");
                None
            }
        }
    };
    let presigned = PresignedOutput {
        video_url: url("video_url"),
        thumbnail_url: url("thumbnail_url"),
        metadata_url: url("metadata_url"),
    };
    (presigned != PresignedOutput::default()).then_some(presigned)
}

fn read_quantization(r: &mut FieldReader<'_, '_>) -> Option<Quantization> {
    let quant = r.object("quantization")?;
    let mut q = r.nested(&quant, "quantization");
    let kind = q.required_str("kind").and_then(|raw| match raw.as_str() {
        "int8" => Some(QuantKind::Int8),
        "fp8" => Some(QuantKind::Fp8),
        _ => {
            q.violation("kind", "must be one of int8, fp8");
            None
        }
    });
    let path = q.required_str("path");
    Some(Quantization {
        kind: kind?,
        path: path?,
    })
}

/// Typed accessors over a payload object that record violations under a
/// dotted field path instead of failing fast.
struct FieldReader<'a, 'v> {
    obj: &'a Map<String, Value>,
    prefix: String,
    violations: &'v mut Vec<Violation>,
}

impl<'a, 'v> FieldReader<'a, 'v> {
    fn new(obj: &'a Map<String, Value>, prefix: &str, violations: &'v mut Vec<Violation>) -> Self {
        Self {
            obj,
            prefix: prefix.to_string(),
            violations,
        }
    }

    fn nested<'b>(&'b mut self, obj: &'b Map<String, Value>, name: &str) -> FieldReader<'b, 'b> {
        FieldReader {
            obj,
            prefix: join_path(&self.prefix, name),
            violations: &mut *self.violations,
        }
    }

    fn violation(&mut self, name: &str, message: impl Into<String>) {
        self.violations
            .push(Violation::new(join_path(&self.prefix, name), message));
    }

    fn has(&self, name: &str) -> bool {
        self.obj.get(name).is_some_and(|v| !v.is_null())
    }

    fn get(&self, name: &str) -> Option<&'a Value> {
        self.obj.get(name).filter(|v| !v.is_null())
    }

    fn opt_str(&mut self, name: &str) -> Option<String> {
        match self.get(name)? {
            Value::String(s) => Some(s.clone()),
            _ => {
                self.violation(name, "must be a string");
                None
            }
        }
    }

    fn required_str(&mut self, name: &str) -> Option<String> {
        if !self.has(name) {
            self.violation(name, "is required");
            return None;
        }
        let value = self.opt_str(name)?;
        if value.trim().is_empty() {
            self.violation(name, "must not be blank");
            return None;
        }
        Some(value)
    }

    fn enum_str<T>(
        &mut self,
        name: &str,
        default: &str,
        allowed: &str,
        parse: impl Fn(&str) -> Option<T>,
    ) -> Option<T> {
        let raw = self.opt_str(name).unwrap_or_else(|| default.to_string());
        let parsed = parse(raw.trim().to_ascii_lowercase().as_str());
        if parsed.is_none() {
            self.violation(name, format!("must be one of {}", allowed));
        }
        parsed
    }

    fn opt_int(&mut self, name: &str) -> Option<i64> {
        let value = self.get(name)?;
        match value.as_i64() {
            Some(n) => Some(n),
            None => {
                self.violation(name, "must be an integer");
                None
            }
        }
    }

    fn int(&mut self, name: &str, default: i64) -> i64 {
        if !self.has(name) {
            return default;
        }
        self.opt_int(name).unwrap_or(default)
    }

    fn float(&mut self, name: &str, default: f64) -> f64 {
        match self.get(name) {
            None => default,
            Some(value) => match value.as_f64() {
                Some(n) => n,
                None => {
                    self.violation(name, "must be a number");
                    default
                }
            },
        }
    }

    fn opt_bool(&mut self, name: &str) -> Option<bool> {
        match self.get(name)? {
            Value::Bool(b) => Some(*b),
            _ => {
                self.violation(name, "must be a boolean");
                None
            }
        }
    }

    fn boolean(&mut self, name: &str, default: bool) -> bool {
        self.opt_bool(name).unwrap_or(default)
    }

    fn object(&mut self, name: &str) -> Option<Map<String, Value>> {
        match self.get(name)? {
            Value::Object(map) => Some(map.clone()),
            _ => {
                self.violation(name, "must be an object");
                None
            }
        }
    }

    /// An asset reference given as a string, or as
    /// `{ "source": <reference>, "checksum_sha256": <hex>? }`.
    fn required_asset(&mut self, name: &str, volume_roots: &[PathBuf]) -> Option<AssetInput> {
        let (raw, checksum) = match self.get(name) {
            Some(Value::Object(obj)) => {
                let mut o = self.nested(obj, name);
                let raw = o.required_str("source");
                let checksum = o.opt_str("checksum_sha256").and_then(|c| match parse_checksum(&c) {
                    Ok(digest) => Some(digest),
                    Err(message) => {
                        o.violation("checksum_sha256", message);
                        None
                    }
                });
                (raw?, checksum)
            }
            _ => (self.required_str(name)?, None),
        };
        match AssetRef::parse(&raw, volume_roots) {
            Ok(source) => Some(AssetInput {
                source,
                checksum_sha256: checksum,
            }),
            Err(message) => {
                self.violation(name, message);
                None
            }
        }
    }

    fn check_int_range(&mut self, name: &str, value: i64, min: i64, max: i64) {
        if value < min || value > max {
            self.violation(name, format!("must be between {} and {}", min, max));
        }
    }

    fn check_float_range(&mut self, name: &str, value: f64, min: f64, max: f64) {
        if !(min..=max).contains(&value) {
            self.violation(name, format!("must be between {} and {}", min, max));
        }
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}
