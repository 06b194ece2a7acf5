//! Frame spooling, muxing and thumbnails.

pub mod ffmpeg;
pub mod thumbnail;

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::embedding::AudioTrack;
use crate::engine::Frame;
use crate::error::MuxError;

pub use ffmpeg::FfmpegMuxer;
pub use thumbnail::encode_thumbnail;

/// Generated frames appended to a raw RGB24 file in the job workspace.
#[derive(Debug)]
pub struct FrameSpool {
    path: PathBuf,
    writer: Option<BufWriter<tokio::fs::File>>,
    width: u32,
    height: u32,
    count: u32,
    first: Option<Frame>,
}

impl FrameSpool {
    pub async fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = tokio::fs::File::create(&path).await?;
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            width: 0,
            height: 0,
            count: 0,
            first: None,
        })
    }

    /// Appends frames. Every frame must match the first frame's size.
    pub async fn append(&mut self, frames: &[Frame]) -> io::Result<()> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "frame spool is already finished")
        })?;
        for frame in frames {
            let (width, height) = frame.dimensions();
            if self.first.is_none() {
                self.width = width;
                self.height = height;
                self.first = Some(frame.clone());
            } else if (width, height) != (self.width, self.height) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "frame is {}x{}, spool holds {}x{}",
                        width, height, self.width, self.height
                    ),
                ));
            }
            writer.write_all(frame.as_raw()).await?;
            self.count += 1;
        }
        Ok(())
    }

    /// Flushes and closes the spool file.
    pub async fn finish(&mut self) -> io::Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await?;
            writer.into_inner().sync_all().await?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn len(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn first_frame(&self) -> Option<&Frame> {
        self.first.as_ref()
    }
}

#[async_trait]
pub trait MediaMuxer: Send + Sync {
    /// Encodes the spooled frames with `audio` into a video at `out`.
    async fn mux(&self, frames: &FrameSpool, audio: &AudioTrack, out: &Path)
        -> Result<PathBuf, MuxError>;
}
