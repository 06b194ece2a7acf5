use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::config::MediaConfig;
use crate::embedding::AudioTrack;
use crate::error::MuxError;
use crate::request::MixingMode;
use crate::sanitize;

use super::{FrameSpool, MediaMuxer};

const STDERR_MAX_CHARS: usize = 2000;

/// Muxes spooled frames and audio with an `ffmpeg` binary.
pub struct FfmpegMuxer {
    program: String,
    fps: u32,
}

impl FfmpegMuxer {
    pub fn new(program: impl Into<String>, fps: u32) -> Self {
        Self {
            program: program.into(),
            fps,
        }
    }

    pub fn from_config(config: &MediaConfig) -> Self {
        Self::new(config.ffmpeg_path.clone(), config.fps)
    }

    fn args(&self, frames: &FrameSpool, audio: &AudioTrack, out: &Path) -> Vec<String> {
        let (width, height) = frames.dimensions();
        let mut args: Vec<String> = vec![
            "-y".into(),
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgb24".into(),
            "-s".into(),
            format!("{}x{}", width, height),
            "-r".into(),
            self.fps.to_string(),
            "-i".into(),
            frames.path().to_string_lossy().into_owned(),
        ];
        for clip in audio.clips() {
            args.push("-i".into());
            args.push(clip.to_string_lossy().into_owned());
        }

        match audio {
            AudioTrack::Single(_) => {
                args.extend(["-map", "0:v", "-map", "1:a"].map(String::from));
            }
            AudioTrack::Mixed { mode, .. } => {
                let filter = match mode {
                    MixingMode::Parallel => "[1:a][2:a]amix=inputs=2:duration=longest[a]",
                    MixingMode::Concatenated => "[1:a][2:a]concat=n=2:v=0:a=1[a]",
                };
                args.extend(
                    ["-filter_complex", filter, "-map", "0:v", "-map", "[a]"].map(String::from),
                );
            }
        }

        args.extend(
            [
                "-c:v", "libx264", "-pix_fmt", "yuv420p", "-c:a", "aac", "-shortest",
            ]
            .map(String::from),
        );
        args.push(out.to_string_lossy().into_owned());
        args
    }
}

#[async_trait]
impl MediaMuxer for FfmpegMuxer {
    async fn mux(
        &self,
        frames: &FrameSpool,
        audio: &AudioTrack,
        out: &Path,
    ) -> Result<PathBuf, MuxError> {
        if frames.is_empty() {
            return Err(MuxError::NoFrames);
        }

        let args = self.args(frames, audio, out);
        debug!("Running {} with {} arguments", self.program, args.len());
        let output = Command::new(&self.program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| MuxError::Spawn {
                program: self.program.clone(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MuxError::Exit {
                status: output.status.to_string(),
                stderr: sanitize::excerpt(stderr.trim(), STDERR_MAX_CHARS),
            });
        }

        tokio::fs::metadata(out).await?;
        Ok(out.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Frame;
    use tempfile::TempDir;

    async fn spool(dir: &Path, frames: usize) -> FrameSpool {
        let mut spool = FrameSpool::create(dir.join("frames.rgb")).await.unwrap();
        let frames: Vec<Frame> = (0..frames)
            .map(|_| Frame::from_pixel(4, 2, image::Rgb([0, 0, 0])))
            .collect();
        spool.append(&frames).await.unwrap();
        spool.finish().await.unwrap();
        spool
    }

    #[tokio::test]
    async fn test_single_speaker_args() {
        let dir = TempDir::new().unwrap();
        let spool = spool(dir.path(), 1).await;
        let muxer = FfmpegMuxer::new("ffmpeg", 25);
        let args = muxer.args(
            &spool,
            &AudioTrack::Single(PathBuf::from("/in/a.wav")),
            Path::new("/out/v.mp4"),
        );
        let joined = args.join(" ");
        assert!(joined.contains("-s 4x2 -r 25"));
        assert!(joined.contains("-i /in/a.wav -map 0:v -map 1:a"));
        assert!(!joined.contains("filter_complex"));
        assert_eq!(args.last().unwrap(), "/out/v.mp4");
    }

    #[tokio::test]
    async fn test_duet_args_use_mix_filter() {
        let dir = TempDir::new().unwrap();
        let spool = spool(dir.path(), 1).await;
        let muxer = FfmpegMuxer::new("ffmpeg", 25);
        let track = |mode| AudioTrack::Mixed {
            first: PathBuf::from("/in/a.wav"),
            second: PathBuf::from("/in/b.wav"),
            mode,
        };

        let parallel = muxer
            .args(&spool, &track(MixingMode::Parallel), Path::new("/o.mp4"))
            .join(" ");
        assert!(parallel.contains("amix=inputs=2"));

        let concatenated = muxer
            .args(&spool, &track(MixingMode::Concatenated), Path::new("/o.mp4"))
            .join(" ");
        assert!(concatenated.contains("concat=n=2:v=0:a=1"));
        assert!(concatenated.contains("-i /in/a.wav -i /in/b.wav"));
    }

    #[tokio::test]
    async fn test_empty_spool_is_rejected() {
        let dir = TempDir::new().unwrap();
        let spool = spool(dir.path(), 0).await;
        let muxer = FfmpegMuxer::new("ffmpeg", 25);
        let err = muxer
            .mux(
                &spool,
                &AudioTrack::Single(PathBuf::from("/in/a.wav")),
                &dir.path().join("v.mp4"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MuxError::NoFrames));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let dir = TempDir::new().unwrap();
        let spool = spool(dir.path(), 1).await;
        let muxer = FfmpegMuxer::new("/nonexistent/ffmpeg", 25);
        let err = muxer
            .mux(
                &spool,
                &AudioTrack::Single(PathBuf::from("/in/a.wav")),
                &dir.path().join("v.mp4"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MuxError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_failing_tool_reports_stderr() {
        let dir = TempDir::new().unwrap();
        let spool = spool(dir.path(), 1).await;
        // `sh` rejects the ffmpeg flags and exits non-zero.
        let muxer = FfmpegMuxer::new("sh", 25);
        let err = muxer
            .mux(
                &spool,
                &AudioTrack::Single(PathBuf::from("/in/a.wav")),
                &dir.path().join("v.mp4"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MuxError::Exit { .. }));
    }
}
