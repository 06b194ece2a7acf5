use std::path::PathBuf;

use crate::config::WorkerConfig;

pub struct PipelineConfig {
    pub workspace_root: PathBuf,
    pub output_prefix: String,
    pub max_inline_bytes: u64,
    pub fps: u32,
    pub thumbnail_max_edge: u32,
}

impl PipelineConfig {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            workspace_root: config.workspace_root.clone(),
            output_prefix: config.output.prefix.clone(),
            max_inline_bytes: config.output.max_inline_bytes,
            fps: config.media.fps,
            thumbnail_max_edge: config.media.thumbnail_max_edge,
        }
    }
}
