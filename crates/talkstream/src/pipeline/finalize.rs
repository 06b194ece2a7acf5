//! Muxing and artifact persistence.

use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine as _;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::debug;

use crate::embedding::AudioTrack;
use crate::error::{MuxError, StoreError};
use crate::job::{ArtifactDescriptor, ArtifactKind, Job, VideoSummary};
use crate::media::{encode_thumbnail, FrameSpool, MediaMuxer};
use crate::request::{JobSpec, OutputTarget, PresignedOutput};
use crate::staging::Workspace;
use crate::storage::{checksum, ArtifactKeys, ObjectStore, PresignedUploader};

use super::error::{PipelineError, PipelineWarning};
use super::generation::GenerationSummary;

/// Store backends available to the finalizer, one per output target, plus
/// the uploader for caller-signed destinations.
#[derive(Clone, Default)]
pub struct StoreSet {
    pub object_store: Option<Arc<dyn ObjectStore>>,
    pub volume: Option<Arc<dyn ObjectStore>>,
    pub presigned: PresignedUploader,
}

impl StoreSet {
    /// Whether every artifact of `spec` has a destination.
    pub fn serves(&self, spec: &JobSpec) -> bool {
        spec.presigned
            .as_ref()
            .is_some_and(PresignedOutput::covers_all)
            || self.supports(spec.output_target)
    }

    pub fn supports(&self, target: OutputTarget) -> bool {
        match target {
            OutputTarget::ObjectStore => self.object_store.is_some(),
            OutputTarget::Volume => self.volume.is_some(),
            OutputTarget::Inline => true,
        }
    }

    fn for_target(&self, target: OutputTarget) -> Result<Option<&Arc<dyn ObjectStore>>, StoreError> {
        let store = match target {
            OutputTarget::Inline => return Ok(None),
            OutputTarget::ObjectStore => self.object_store.as_ref(),
            OutputTarget::Volume => self.volume.as_ref(),
        };
        store
            .map(Some)
            .ok_or_else(|| StoreError::Unconfigured(target_label(target).to_string()))
    }
}

fn target_label(target: OutputTarget) -> &'static str {
    match target {
        OutputTarget::ObjectStore => "object_store",
        OutputTarget::Volume => "volume",
        OutputTarget::Inline => "inline",
    }
}

/// Muxed video plus the encoded thumbnail and metadata document, ready to
/// upload.
#[derive(Debug)]
pub struct RenderedMedia {
    pub video: PathBuf,
    pub thumbnail: Vec<u8>,
    pub metadata: Vec<u8>,
}

pub struct ArtifactFinalizer {
    muxer: Arc<dyn MediaMuxer>,
    stores: StoreSet,
    prefix: String,
    max_inline_bytes: u64,
    fps: u32,
    thumbnail_max_edge: u32,
}

impl ArtifactFinalizer {
    pub fn new(
        muxer: Arc<dyn MediaMuxer>,
        stores: StoreSet,
        prefix: impl Into<String>,
        max_inline_bytes: u64,
        fps: u32,
        thumbnail_max_edge: u32,
    ) -> Self {
        Self {
            muxer,
            stores,
            prefix: prefix.into(),
            max_inline_bytes,
            fps,
            thumbnail_max_edge,
        }
    }

    pub fn stores(&self) -> &StoreSet {
        &self.stores
    }

    pub fn keys(&self, job: &Job) -> ArtifactKeys {
        ArtifactKeys::for_job(&self.prefix, &job.id, job.item_id(), &job.spec.save_name())
    }

    pub async fn render(
        &self,
        job: &Job,
        spool: &FrameSpool,
        track: &AudioTrack,
        summary: &GenerationSummary,
        workspace: &Workspace,
    ) -> Result<RenderedMedia, PipelineError> {
        let first = spool.first_frame().ok_or(MuxError::NoFrames)?;
        let out = workspace.file(&format!("{}.mp4", job.spec.save_name()));
        let video = self.muxer.mux(spool, track, &out).await?;
        let thumbnail = encode_thumbnail(first, self.thumbnail_max_edge)?;
        let metadata = serde_json::to_vec_pretty(&self.metadata_document(job, summary))
            .map_err(|e| MuxError::Io(std::io::Error::other(e)))?;

        Ok(RenderedMedia {
            video,
            thumbnail,
            metadata,
        })
    }

    pub fn metadata_document(&self, job: &Job, summary: &GenerationSummary) -> Value {
        json!({
            "job_id": job.id,
            "item_id": job.item_id(),
            "correlation_id": job.correlation_id,
            "params": job.spec.echo_params(),
            "frames": summary.frames,
            "fps": self.fps,
            "chunk_count": summary.chunks.len(),
            "chunks": summary.chunks,
            "truncated": summary.truncated,
            "created_at": Utc::now().to_rfc3339(),
        })
    }

    /// Stores the three artifacts. An artifact with a caller-signed URL is
    /// PUT there; the rest go to the job's output target. Keys depend only
    /// on the job, so a retry overwrites the previous attempt.
    pub async fn persist(
        &self,
        job: &Job,
        media: &RenderedMedia,
    ) -> Result<(Vec<ArtifactDescriptor>, Vec<PipelineWarning>), PipelineError> {
        let keys = self.keys(job);
        let video = tokio::fs::read(&media.video)
            .await
            .map_err(|e| StoreError::Read {
                path: media.video.clone(),
                source: e,
            })?;

        let signed = job.spec.presigned.clone().unwrap_or_default();
        let uploads = [
            (ArtifactKind::Video, keys.video, video, signed.video_url),
            (
                ArtifactKind::Thumbnail,
                keys.thumbnail,
                media.thumbnail.clone(),
                signed.thumbnail_url,
            ),
            (
                ArtifactKind::Metadata,
                keys.metadata,
                media.metadata.clone(),
                signed.metadata_url,
            ),
        ];

        let unsigned = uploads.iter().filter(|(_, _, _, url)| url.is_none());
        let store = match unsigned.clone().next() {
            Some(_) => self.stores.for_target(job.spec.output_target)?,
            None => None,
        };
        let mut warnings = Vec::new();

        if store.is_none() {
            let total: u64 = unsigned.map(|(_, _, bytes, _)| bytes.len() as u64).sum();
            if total > self.max_inline_bytes {
                return Err(StoreError::InlineTooLarge {
                    bytes: total,
                    limit: self.max_inline_bytes,
                }
                .into());
            }
            if total > 0 {
                warnings.push(PipelineWarning::InlineOutput { bytes: total });
            }
        }

        let mut artifacts = Vec::with_capacity(uploads.len());
        for (kind, key, bytes, url) in uploads {
            let size = bytes.len() as u64;
            let digest = checksum(&bytes);
            let (location, base64) = match (url, store) {
                (Some(url), _) => {
                    let location = self.stores.presigned.put(&url, bytes, kind.mime()).await?;
                    (location, None)
                }
                (None, Some(store)) => (store.put(&key, bytes, kind.mime()).await?, None),
                (None, None) => (
                    format!("inline:{}", key),
                    Some(base64::engine::general_purpose::STANDARD.encode(&bytes)),
                ),
            };
            debug!("Persisted {:?} artifact ({} bytes)", kind, size);
            artifacts.push(ArtifactDescriptor {
                kind,
                key,
                location,
                mime: kind.mime().to_string(),
                bytes: size,
                checksum: digest,
                base64,
            });
        }

        Ok((artifacts, warnings))
    }
}

/// Condensed view of the video artifact for the success result.
pub fn video_summary(artifacts: &[ArtifactDescriptor]) -> Option<VideoSummary> {
    let video = artifacts.iter().find(|a| a.kind == ArtifactKind::Video)?;
    let thumbnail = artifacts
        .iter()
        .find(|a| a.kind == ArtifactKind::Thumbnail)
        .map(|a| a.location.clone());
    Some(VideoSummary {
        location: video.location.clone(),
        mime: video.mime.clone(),
        bytes: video.bytes,
        checksum: video.checksum.clone(),
        thumbnail,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{validate_request, ValidatedRequest, ValidationContext};
    use crate::storage::FilesystemStore;
    use async_trait::async_trait;
    use std::path::Path;
    use tempfile::TempDir;

    struct CopyMuxer;

    #[async_trait]
    impl MediaMuxer for CopyMuxer {
        async fn mux(
            &self,
            frames: &FrameSpool,
            _audio: &AudioTrack,
            out: &Path,
        ) -> Result<PathBuf, MuxError> {
            tokio::fs::copy(frames.path(), out).await?;
            Ok(out.to_path_buf())
        }
    }

    fn job(target: &str) -> Job {
        job_with(serde_json::json!({ "output_target": target }))
    }

    fn job_with(extra: Value) -> Job {
        let mut payload = serde_json::json!({
            "prompt": "hello",
            "visual_reference": "https://example.com/a.png",
            "audio": { "person1": "https://example.com/a.wav" },
            "sampling_steps": 8
        });
        if let (Some(base), Value::Object(extra)) = (payload.as_object_mut(), extra) {
            base.extend(extra);
        }
        match validate_request(&payload, ValidationContext::empty()).unwrap() {
            ValidatedRequest::Single(spec) => Job::new("job-1", payload, spec),
            _ => unreachable!(),
        }
    }

    async fn rendered(finalizer: &ArtifactFinalizer, job: &Job, ws: &Workspace) -> RenderedMedia {
        let mut spool = FrameSpool::create(ws.file("frames.rgb")).await.unwrap();
        spool
            .append(&[crate::engine::Frame::from_pixel(8, 8, image::Rgb([1, 2, 3]))])
            .await
            .unwrap();
        spool.finish().await.unwrap();
        let summary = GenerationSummary {
            chunks: Vec::new(),
            frames: 1,
            truncated: false,
        };
        finalizer
            .render(job, &spool, &AudioTrack::Single(PathBuf::from("/a.wav")), &summary, ws)
            .await
            .unwrap()
    }

    fn finalizer(stores: StoreSet, max_inline: u64) -> ArtifactFinalizer {
        ArtifactFinalizer::new(Arc::new(CopyMuxer), stores, "talkstream", max_inline, 25, 480)
    }

    #[tokio::test]
    async fn test_volume_persist_uses_deterministic_keys() {
        let volume = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let ws = Workspace::create(root.path(), "job-1").unwrap();
        let stores = StoreSet {
            volume: Some(Arc::new(FilesystemStore::new(volume.path()))),
            ..Default::default()
        };
        let finalizer = finalizer(stores, 1024);
        let job = job("volume");
        let media = rendered(&finalizer, &job, &ws).await;

        let (artifacts, warnings) = finalizer.persist(&job, &media).await.unwrap();
        assert!(warnings.is_empty());
        assert_eq!(artifacts.len(), 3);
        assert_eq!(artifacts[0].key, "talkstream/job-1/talk_low_8_seed42.mp4");
        assert_eq!(artifacts[0].bytes, 8 * 8 * 3);
        assert!(Path::new(&artifacts[0].location).exists());

        let metadata: Value = serde_json::from_slice(
            &std::fs::read(volume.path().join("talkstream/job-1/metadata.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(metadata["frames"], 1);
        assert_eq!(metadata["params"]["sampling_steps"], 8);

        let summary = video_summary(&artifacts).unwrap();
        assert_eq!(summary.checksum, artifacts[0].checksum);
        assert!(summary.thumbnail.unwrap().ends_with("thumbnail.jpg"));
    }

    #[tokio::test]
    async fn test_inline_output_is_bounded() {
        let root = TempDir::new().unwrap();
        let ws = Workspace::create(root.path(), "job-1").unwrap();
        let job = job("inline");

        let small = finalizer(StoreSet::default(), 16);
        let media = rendered(&small, &job, &ws).await;
        let err = small.persist(&job, &media).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Store(StoreError::InlineTooLarge { limit: 16, .. })
        ));

        let roomy = finalizer(StoreSet::default(), 1024 * 1024);
        let (artifacts, warnings) = roomy.persist(&job, &media).await.unwrap();
        assert!(artifacts.iter().all(|a| a.base64.is_some()));
        assert!(matches!(warnings[0], PipelineWarning::InlineOutput { .. }));
    }

    #[tokio::test]
    async fn test_missing_store_is_unconfigured() {
        let root = TempDir::new().unwrap();
        let ws = Workspace::create(root.path(), "job-1").unwrap();
        let job = job("object_store");
        let finalizer = finalizer(StoreSet::default(), 1024);
        assert!(!finalizer.stores().supports(OutputTarget::ObjectStore));
        let media = rendered(&finalizer, &job, &ws).await;
        let err = finalizer.persist(&job, &media).await.unwrap_err();
        assert!(matches!(err, PipelineError::Store(StoreError::Unconfigured(_))));
    }

    #[tokio::test]
    async fn test_signed_urls_take_precedence_over_target() {
        let (base, server) = crate::storage::presigned::testing::serve_once(200).await;
        let volume = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let ws = Workspace::create(root.path(), "job-1").unwrap();
        let stores = StoreSet {
            volume: Some(Arc::new(FilesystemStore::new(volume.path()))),
            ..Default::default()
        };
        let finalizer = finalizer(stores, 1024);
        let job = job_with(serde_json::json!({
            "output_target": "volume",
            "output_config": { "video_url": format!("{}/renders/v.mp4?X-Amz-Signature=s", base) }
        }));
        let media = rendered(&finalizer, &job, &ws).await;

        let (artifacts, _) = finalizer.persist(&job, &media).await.unwrap();
        let (request_line, content_type, body) = server.await.unwrap();
        assert!(request_line.starts_with("PUT /renders/v.mp4"));
        assert_eq!(content_type, "video/mp4");
        assert_eq!(body.len() as u64, artifacts[0].bytes);

        assert_eq!(artifacts[0].location, format!("{}/renders/v.mp4", base));
        assert!(artifacts[0].base64.is_none());
        assert!(volume.path().join("talkstream/job-1/thumbnail.jpg").exists());
        assert!(!volume
            .path()
            .join("talkstream/job-1/talk_low_8_seed42.mp4")
            .exists());
    }

    #[test]
    fn test_fully_signed_job_needs_no_store() {
        let signed = job_with(serde_json::json!({
            "output_target": "object_store",
            "output_config": {
                "video_url": "https://bucket.example.com/v.mp4?sig=1",
                "thumbnail_url": "https://bucket.example.com/t.jpg?sig=1",
                "metadata_url": "https://bucket.example.com/m.json?sig=1"
            }
        }));
        let stores = StoreSet::default();
        assert!(!stores.supports(OutputTarget::ObjectStore));
        assert!(stores.serves(&signed.spec));
        assert!(!stores.serves(&job("object_store").spec));
    }

    #[tokio::test]
    async fn test_rejected_signed_upload_fails_persist() {
        let (base, server) = crate::storage::presigned::testing::serve_once(403).await;
        let root = TempDir::new().unwrap();
        let ws = Workspace::create(root.path(), "job-1").unwrap();
        let finalizer = finalizer(StoreSet::default(), 1024 * 1024);
        let job = job_with(serde_json::json!({
            "output_target": "inline",
            "output_config": { "video_url": format!("{}/v.mp4?sig=secret", base) }
        }));
        let media = rendered(&finalizer, &job, &ws).await;

        let err = finalizer.persist(&job, &media).await.unwrap_err();
        server.await.unwrap();
        match err {
            PipelineError::Store(StoreError::Http { key, status, .. }) => {
                assert_eq!(status, Some(403));
                assert!(!key.contains("secret"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
