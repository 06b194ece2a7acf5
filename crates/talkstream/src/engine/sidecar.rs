//! Inference sidecar client. The model runs in a separate process that
//! speaks newline-delimited JSON over stdin/stdout:
//!
//! request:  `{"id": 7, "method": "generate_chunk", "params": {...}}`
//! progress: `{"id": 7, "event": "progress", "step": 3, "total": 40}`
//! reply:    `{"id": 7, "ok": true, "result": {...}}`
//!           `{"id": 7, "ok": false, "error": {"message": "...", "kind": "oom"}}`
//!
//! Frames travel as raw RGB24 files inside the job workspace.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::embedding::{FeatureExtractor, SpeakerFeatures, SpeechSynthesizer};
use crate::error::{EmbeddingError, EngineError};
use crate::staging::Workspace;

use super::{
    CarriedState, ChunkOutput, Conditioning, Frame, GenerationEngine, SamplingObserver,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl SidecarCommand {
    /// `None` when no sidecar command is configured.
    pub fn from_config(config: &EngineConfig) -> Option<Self> {
        let (program, args) = config.command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            env: config.env.clone(),
        })
    }
}

struct SidecarProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

#[derive(Debug, Deserialize)]
struct RemoteError {
    message: String,
    #[serde(default)]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Reply {
    id: Option<u64>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    step: u32,
    #[serde(default)]
    total: u32,
    #[serde(default)]
    ok: Option<bool>,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RemoteError>,
}

enum CallError {
    Spawn(String),
    Transport(String),
    Remote(RemoteError),
}

impl CallError {
    fn into_engine(self) -> EngineError {
        match self {
            CallError::Spawn(message) => EngineError::Load(message),
            CallError::Transport(message) => EngineError::Protocol(message),
            CallError::Remote(remote) => match remote.kind.as_deref() {
                Some("oom") => EngineError::OutOfMemory(remote.message),
                Some("load") => EngineError::Load(remote.message),
                Some("transient") => EngineError::Runtime {
                    message: remote.message,
                    transient: true,
                },
                _ => EngineError::Runtime {
                    message: remote.message,
                    transient: false,
                },
            },
        }
    }

    fn into_embedding(self, synthesis: bool) -> EmbeddingError {
        let (message, transient) = match self {
            CallError::Spawn(message) => return EmbeddingError::ModelLoad(message),
            CallError::Transport(message) => (message, true),
            CallError::Remote(remote) => match remote.kind.as_deref() {
                Some("load") => return EmbeddingError::ModelLoad(remote.message),
                Some("transient") => (remote.message, true),
                _ => (remote.message, false),
            },
        };
        if synthesis {
            EmbeddingError::Synthesis { message, transient }
        } else {
            EmbeddingError::Extraction { message, transient }
        }
    }
}

#[derive(Serialize)]
struct ChunkParams<'a> {
    prompt: &'a str,
    negative_prompt: Option<&'a str>,
    visual: &'a Path,
    speakers: Vec<&'a Path>,
    bbox: Option<crate::request::BoundingBox>,
    size: crate::request::SizeBucket,
    frame_count: u32,
    motion_window: u32,
    sampling: crate::request::SamplingParams,
    acceleration: crate::request::Acceleration,
    vram: crate::request::VramPolicy,
    quantization: Option<&'a crate::request::Quantization>,
    chunk_index: u32,
    start_frame: u32,
    output_dir: &'a Path,
    carried: Option<FrameFile>,
}

/// Location and geometry of a raw RGB24 frame file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FrameFile {
    path: PathBuf,
    width: u32,
    height: u32,
    count: usize,
}

#[derive(Debug, Deserialize)]
struct ChunkResult {
    #[serde(flatten)]
    frames: FrameFile,
    #[serde(default)]
    is_final: bool,
}

#[derive(Debug, Deserialize)]
struct PathResult {
    path: PathBuf,
}

/// Engine, feature extractor and speech synthesizer backed by one sidecar
/// process. The process is spawned on first use and reused across jobs.
pub struct SidecarEngine {
    command: SidecarCommand,
    process: Mutex<Option<SidecarProcess>>,
    next_id: AtomicU64,
}

impl SidecarEngine {
    pub fn new(command: SidecarCommand) -> Self {
        Self {
            command,
            process: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    fn spawn(&self) -> Result<SidecarProcess, CallError> {
        info!("Starting inference sidecar '{}'", self.command.program);
        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .envs(&self.command.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CallError::Spawn(format!(
                    "failed to start sidecar '{}': {}",
                    self.command.program, e
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CallError::Spawn("sidecar stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CallError::Spawn("sidecar stdout unavailable".to_string()))?;

        Ok(SidecarProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    async fn call(
        &self,
        method: &str,
        params: Value,
        observer: Option<&dyn SamplingObserver>,
    ) -> Result<Value, CallError> {
        let mut guard = self.process.lock().await;
        if guard.is_none() {
            *guard = Some(self.spawn()?);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let result = match guard.as_mut() {
            Some(process) => exchange(process, id, method, params, observer).await,
            None => Err(CallError::Transport("sidecar is not running".to_string())),
        };

        // A broken pipe leaves the process unusable; respawn on next call.
        if matches!(result, Err(CallError::Transport(_))) {
            if let Some(mut process) = guard.take() {
                let _ = process.child.start_kill();
            }
        }
        result
    }
}

async fn exchange(
    process: &mut SidecarProcess,
    id: u64,
    method: &str,
    params: Value,
    observer: Option<&dyn SamplingObserver>,
) -> Result<Value, CallError> {
    let mut line = json!({ "id": id, "method": method, "params": params }).to_string();
    line.push('\n');
    process
        .stdin
        .write_all(line.as_bytes())
        .await
        .map_err(|e| CallError::Transport(format!("failed to write to sidecar: {}", e)))?;
    process
        .stdin
        .flush()
        .await
        .map_err(|e| CallError::Transport(format!("failed to write to sidecar: {}", e)))?;

    loop {
        let raw = process
            .stdout
            .next_line()
            .await
            .map_err(|e| CallError::Transport(format!("failed to read from sidecar: {}", e)))?
            .ok_or_else(|| CallError::Transport("sidecar exited mid-request".to_string()))?;

        let reply: Reply = match serde_json::from_str(&raw) {
            Ok(reply) => reply,
            Err(_) => {
                debug!("Ignoring non-protocol sidecar output: {}", raw);
                continue;
            }
        };
        if reply.id != Some(id) {
            debug!("Ignoring sidecar reply for request {:?}", reply.id);
            continue;
        }

        if reply.event.as_deref() == Some("progress") {
            if let Some(observer) = observer {
                observer.on_step(reply.step, reply.total);
            }
            continue;
        }

        return match (reply.ok, reply.error) {
            (Some(true), _) => Ok(reply.result),
            (_, Some(error)) => Err(CallError::Remote(error)),
            _ => Err(CallError::Transport(format!(
                "malformed sidecar reply to '{}'",
                method
            ))),
        };
    }
}

/// Writes frames as one raw RGB24 file.
async fn write_frames(path: &Path, frames: &[Frame]) -> Result<FrameFile, EngineError> {
    let (width, height) = frames.first().map(|f| f.dimensions()).unwrap_or((0, 0));
    let mut bytes = Vec::with_capacity(frames.len() * (width * height * 3) as usize);
    for frame in frames {
        bytes.extend_from_slice(frame.as_raw());
    }
    tokio::fs::write(path, &bytes)
        .await
        .map_err(|e| EngineError::Protocol(format!("failed to write carried frames: {}", e)))?;
    Ok(FrameFile {
        path: path.to_path_buf(),
        width,
        height,
        count: frames.len(),
    })
}

/// Splits a raw RGB24 buffer into frames.
fn decode_frames(bytes: Vec<u8>, width: u32, height: u32, count: usize) -> Result<Vec<Frame>, EngineError> {
    let frame_len = width as usize * height as usize * 3;
    if bytes.len() != frame_len * count {
        return Err(EngineError::Protocol(format!(
            "frame file holds {} bytes, expected {} frames of {}x{}",
            bytes.len(),
            count,
            width,
            height
        )));
    }
    if frame_len == 0 {
        return Ok(Vec::new());
    }
    bytes
        .chunks_exact(frame_len)
        .map(|chunk| {
            Frame::from_raw(width, height, chunk.to_vec())
                .ok_or_else(|| EngineError::Protocol("frame buffer too small".to_string()))
        })
        .collect()
}

#[async_trait]
impl GenerationEngine for SidecarEngine {
    async fn warmup(&self) -> Result<(), EngineError> {
        self.call("warmup", json!({}), None)
            .await
            .map(|_| ())
            .map_err(CallError::into_engine)
    }

    async fn generate_chunk(
        &self,
        conditioning: &Conditioning,
        carried: Option<&CarriedState>,
        observer: &dyn SamplingObserver,
    ) -> Result<ChunkOutput, EngineError> {
        let carried = match carried {
            Some(state) => {
                let path = conditioning
                    .work_dir
                    .join(format!("carried_{}.rgb", state.source_chunk));
                Some(write_frames(&path, &state.frames).await?)
            }
            None => None,
        };

        let params = ChunkParams {
            prompt: &conditioning.prompt,
            negative_prompt: conditioning.negative_prompt.as_deref(),
            visual: &conditioning.visual,
            speakers: conditioning.speakers.iter().map(|s| s.path.as_path()).collect(),
            bbox: conditioning.bbox,
            size: conditioning.size,
            frame_count: conditioning.frame_count,
            motion_window: conditioning.motion_window,
            sampling: conditioning.sampling,
            acceleration: conditioning.acceleration,
            vram: conditioning.vram,
            quantization: conditioning.quantization.as_ref(),
            chunk_index: conditioning.chunk_index,
            start_frame: conditioning.start_frame,
            output_dir: &conditioning.work_dir,
            carried,
        };
        let params = serde_json::to_value(&params)
            .map_err(|e| EngineError::Protocol(format!("failed to encode request: {}", e)))?;

        let result = self
            .call("generate_chunk", params, Some(observer))
            .await
            .map_err(CallError::into_engine)?;
        let chunk: ChunkResult = serde_json::from_value(result)
            .map_err(|e| EngineError::Protocol(format!("malformed chunk result: {}", e)))?;

        let bytes = tokio::fs::read(&chunk.frames.path)
            .await
            .map_err(|e| EngineError::Protocol(format!("failed to read chunk frames: {}", e)))?;
        let frames = decode_frames(
            bytes,
            chunk.frames.width,
            chunk.frames.height,
            chunk.frames.count,
        )?;
        let _ = tokio::fs::remove_file(&chunk.frames.path).await;

        Ok(ChunkOutput {
            frames,
            is_final: chunk.is_final,
        })
    }

    async fn dispose(&self) -> Result<(), EngineError> {
        let outcome = self.call("dispose", json!({}), None).await;
        if let Some(mut process) = self.process.lock().await.take() {
            if let Err(e) = process.child.kill().await {
                warn!("Failed to stop inference sidecar: {}", e);
            }
        }
        outcome.map(|_| ()).map_err(CallError::into_engine)
    }
}

#[async_trait]
impl FeatureExtractor for SidecarEngine {
    async fn embed(
        &self,
        audio: &Path,
        speaker_index: usize,
        workspace: &Workspace,
    ) -> Result<SpeakerFeatures, EmbeddingError> {
        let params = json!({
            "audio": audio,
            "speaker_index": speaker_index,
            "output_dir": workspace.path(),
        });
        let result = self
            .call("embed", params, None)
            .await
            .map_err(|e| e.into_embedding(false))?;
        let parsed: PathResult =
            serde_json::from_value(result).map_err(|e| EmbeddingError::Extraction {
                message: format!("malformed embed result: {}", e),
                transient: false,
            })?;
        Ok(SpeakerFeatures {
            speaker_index,
            path: parsed.path,
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for SidecarEngine {
    async fn synthesize(
        &self,
        text: &str,
        voice: Option<&str>,
        speaker_index: usize,
        workspace: &Workspace,
    ) -> Result<PathBuf, EmbeddingError> {
        let params = json!({
            "text": text,
            "voice": voice,
            "speaker_index": speaker_index,
            "output_dir": workspace.path(),
        });
        let result = self
            .call("synthesize", params, None)
            .await
            .map_err(|e| e.into_embedding(true))?;
        let parsed: PathResult =
            serde_json::from_value(result).map_err(|e| EmbeddingError::Synthesis {
                message: format!("malformed synthesize result: {}", e),
                transient: false,
            })?;
        Ok(parsed.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn sidecar(script: &str) -> SidecarEngine {
        SidecarEngine::new(SidecarCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: HashMap::new(),
        })
    }

    #[derive(Default)]
    struct Steps(StdMutex<Vec<(u32, u32)>>);

    impl SamplingObserver for Steps {
        fn on_step(&self, step: u32, total: u32) {
            self.0.lock().unwrap().push((step, total));
        }
    }

    #[test]
    fn test_command_from_config() {
        let mut config = EngineConfig::default();
        assert!(SidecarCommand::from_config(&config).is_none());
        config.command = vec!["python3".to_string(), "serve.py".to_string()];
        let command = SidecarCommand::from_config(&config).unwrap();
        assert_eq!(command.program, "python3");
        assert_eq!(command.args, vec!["serve.py"]);
    }

    #[test]
    fn test_remote_error_kinds() {
        let remote = |kind: &str| {
            CallError::Remote(RemoteError {
                message: "boom".to_string(),
                kind: Some(kind.to_string()),
            })
        };
        assert!(matches!(remote("oom").into_engine(), EngineError::OutOfMemory(_)));
        assert!(matches!(remote("load").into_engine(), EngineError::Load(_)));
        assert!(matches!(
            remote("transient").into_engine(),
            EngineError::Runtime { transient: true, .. }
        ));
        assert!(matches!(
            remote("weird").into_engine(),
            EngineError::Runtime { transient: false, .. }
        ));
        assert!(remote("transient").into_embedding(true).is_transient());
        assert!(matches!(
            remote("load").into_embedding(false),
            EmbeddingError::ModelLoad(_)
        ));
    }

    #[test]
    fn test_decode_frames_checks_geometry() {
        let frames = decode_frames(vec![7u8; 2 * 2 * 3 * 3], 2, 2, 3).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].get_pixel(1, 1).0, [7, 7, 7]);
        assert!(decode_frames(vec![0u8; 10], 2, 2, 1).is_err());
    }

    #[tokio::test]
    async fn test_call_relays_progress_and_result() {
        let engine = sidecar(
            r#"read line
echo 'not json'
echo '{"id":1,"event":"progress","step":1,"total":2}'
echo '{"id":1,"event":"progress","step":2,"total":2}'
echo '{"id":1,"ok":true,"result":{"ready":true}}'
read line"#,
        );
        let steps = Steps::default();
        let result = engine.call("warmup", json!({}), Some(&steps)).await.ok();
        assert_eq!(result, Some(json!({ "ready": true })));
        assert_eq!(*steps.0.lock().unwrap(), vec![(1, 2), (2, 2)]);
    }

    #[tokio::test]
    async fn test_remote_oom_maps_to_engine_error() {
        let engine = sidecar(
            r#"read line
echo '{"id":1,"ok":false,"error":{"message":"CUDA out of memory","kind":"oom"}}'
read line"#,
        );
        let err = engine.warmup().await.unwrap_err();
        assert!(matches!(err, EngineError::OutOfMemory(_)));
    }

    #[tokio::test]
    async fn test_exited_sidecar_is_protocol_error() {
        let engine = sidecar("exit 0");
        let err = engine.warmup().await.unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_missing_program_is_load_error() {
        let engine = SidecarEngine::new(SidecarCommand {
            program: "/nonexistent/talkstream-sidecar".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
        });
        assert!(matches!(engine.warmup().await, Err(EngineError::Load(_))));
    }
}
