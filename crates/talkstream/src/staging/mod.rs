//! Input staging: resolves a job's references into local files.

pub mod fetch;
pub mod workspace;

use futures_util::stream::{self, StreamExt};
use tracing::debug;

use crate::config::StagingConfig;
use crate::error::StagingError;
use crate::request::{AssetInput, AudioSource, JobSpec};

pub use fetch::{AssetFetcher, FetchPolicy, StagedAsset};
pub use workspace::Workspace;

/// Local copies of a job's inputs. `audio` is empty for TTS jobs.
#[derive(Debug, Clone)]
pub struct StagedInputs {
    pub visual: StagedAsset,
    pub audio: Vec<StagedAsset>,
}

impl StagedInputs {
    pub fn total_bytes(&self) -> u64 {
        self.visual.bytes + self.audio.iter().map(|a| a.bytes).sum::<u64>()
    }
}

pub struct ResourceStager {
    fetcher: AssetFetcher,
    max_concurrent: usize,
}

impl ResourceStager {
    pub fn from_config(config: &StagingConfig) -> Self {
        Self {
            fetcher: AssetFetcher::new(FetchPolicy::from(config)),
            max_concurrent: config.max_concurrent_fetches.max(1),
        }
    }

    /// Fetches every input of `spec` into `workspace` with bounded
    /// concurrency. `on_staged(done, total)` runs after each completed asset.
    /// The first failure aborts the remaining fetches.
    pub async fn stage(
        &self,
        spec: &JobSpec,
        workspace: &Workspace,
        on_staged: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<StagedInputs, StagingError> {
        let inputs = workspace.subdir("inputs")?;
        let mut wanted: Vec<(&'static str, &AssetInput)> =
            vec![("visual", &spec.visual_reference)];
        if let AudioSource::Recorded { person1, person2 } = &spec.audio {
            wanted.push(("person1", person1));
            if let Some(person2) = person2 {
                wanted.push(("person2", person2));
            }
        }

        let total = wanted.len();
        let fetcher = &self.fetcher;
        let inputs_dir = inputs.as_path();
        let mut fetches = stream::iter(wanted.into_iter().enumerate())
            .map(|(index, (name, reference))| async move {
                (index, fetcher.stage(reference, inputs_dir, name).await)
            })
            .buffer_unordered(self.max_concurrent);

        let mut staged: Vec<Option<StagedAsset>> = vec![None; total];
        let mut done = 0;
        while let Some((index, result)) = fetches.next().await {
            let asset = result?;
            debug!(
                "Staged input {} of {} ({} bytes)",
                index + 1,
                total,
                asset.bytes
            );
            staged[index] = Some(asset);
            done += 1;
            on_staged(done, total);
        }

        let mut assets = staged.into_iter().flatten();
        let visual = assets.next().ok_or_else(|| StagingError::Fetch {
            reference: spec.visual_reference.source.describe(),
            status: None,
            message: "visual reference was not staged".to_string(),
        })?;
        Ok(StagedInputs {
            visual,
            audio: assets.collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{validate_request, ValidatedRequest, ValidationContext};
    use base64::Engine as _;
    use serde_json::json;
    use tempfile::TempDir;

    fn spec(payload: serde_json::Value) -> JobSpec {
        match validate_request(&payload, ValidationContext::empty()).unwrap() {
            ValidatedRequest::Single(spec) => spec,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_stages_inline_and_volume_inputs() {
        let root = TempDir::new().unwrap();
        let volume = TempDir::new().unwrap();
        let voice = volume.path().join("voice.wav");
        std::fs::write(&voice, b"RIFF0000WAVE").unwrap();
        let png = base64::engine::general_purpose::STANDARD.encode(b"\x89PNG\r\n\x1a\nrest");

        let spec = spec(json!({
            "prompt": "hi",
            "visual_reference": format!("data:image/png;base64,{}", png),
            "audio": { "person1": voice.to_string_lossy() }
        }));
        let workspace = Workspace::create(root.path(), "job-1").unwrap();
        let stager = ResourceStager::from_config(&StagingConfig::default());

        let mut calls = Vec::new();
        let staged = stager
            .stage(&spec, &workspace, &mut |done, total| calls.push((done, total)))
            .await
            .unwrap();

        assert_eq!(calls, vec![(1, 2), (2, 2)]);
        assert!(staged.visual.path.ends_with("inputs/visual.png"));
        assert_eq!(staged.audio.len(), 1);
        assert_eq!(staged.audio[0].path, voice);
        assert_eq!(staged.total_bytes(), 12 + 12);
    }

    #[tokio::test]
    async fn test_missing_input_fails_staging() {
        let root = TempDir::new().unwrap();
        let spec = spec(json!({
            "prompt": "hi",
            "visual_reference": "/definitely/not/here.png",
            "audio": { "tts": { "text": "hello" } }
        }));
        let workspace = Workspace::create(root.path(), "job-2").unwrap();
        let stager = ResourceStager::from_config(&StagingConfig::default());

        let err = stager
            .stage(&spec, &workspace, &mut |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, StagingError::MissingFile(_)));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_fails_staging() {
        let root = TempDir::new().unwrap();
        let volume = TempDir::new().unwrap();
        let face = volume.path().join("face.png");
        std::fs::write(&face, b"png").unwrap();
        let spec = spec(json!({
            "prompt": "hi",
            "visual_reference": {
                "source": face.to_string_lossy(),
                "checksum_sha256": "0".repeat(64)
            },
            "audio": { "tts": { "text": "hello" } }
        }));
        let workspace = Workspace::create(root.path(), "job-3").unwrap();
        let stager = ResourceStager::from_config(&StagingConfig::default());

        let err = stager
            .stage(&spec, &workspace, &mut |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, StagingError::ChecksumMismatch { .. }));
    }
}
