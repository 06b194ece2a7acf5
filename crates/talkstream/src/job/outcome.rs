//! Terminal result documents returned to the caller.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::pipeline::classify::{CauseClass, ErrorCode};

use super::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Video,
    Thumbnail,
    Metadata,
}

impl ArtifactKind {
    pub fn mime(&self) -> &'static str {
        match self {
            ArtifactKind::Video => "video/mp4",
            ArtifactKind::Thumbnail => "image/jpeg",
            ArtifactKind::Metadata => "application/json",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactDescriptor {
    pub kind: ArtifactKind,
    pub key: String,
    pub location: String,
    pub mime: String,
    pub bytes: u64,
    /// Hex SHA-256 of the stored bytes.
    pub checksum: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base64: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoSummary {
    pub location: String,
    pub mime: String,
    pub bytes: u64,
    pub checksum: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

/// Per-stage latency breakdown plus total wall time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Timings {
    #[serde(flatten)]
    pub stages: BTreeMap<String, u64>,
    pub total_ms: u64,
}

impl Timings {
    pub fn record(&mut self, stage: Stage, ms: u64) {
        *self.stages.entry(format!("{}_ms", stage.label())).or_insert(0) += ms;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorCause {
    pub class: CauseClass,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    pub stage: Stage,
    pub cause: ErrorCause,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Checkpoint {
    pub stage: Stage,
    pub percent: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diagnostics {
    pub excerpts: Vec<String>,
    pub checkpoints: Vec<Checkpoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Success {
        job_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        item_id: Option<String>,
        video: VideoSummary,
        artifacts: Vec<ArtifactDescriptor>,
        timings: Timings,
        params: Value,
        warnings: Vec<String>,
    },
    Error {
        job_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        item_id: Option<String>,
        error: ErrorRecord,
        diagnostics: Diagnostics,
        timings: Timings,
    },
    Cancelled {
        job_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        item_id: Option<String>,
        stage: Stage,
        timings: Timings,
    },
}

impl JobOutcome {
    pub fn status_label(&self) -> &'static str {
        match self {
            JobOutcome::Success { .. } => "success",
            JobOutcome::Error { .. } => "error",
            JobOutcome::Cancelled { .. } => "cancelled",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success { .. })
    }

    pub fn error(&self) -> Option<&ErrorRecord> {
        match self {
            JobOutcome::Error { error, .. } => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Success,
    Partial,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemOutcome {
    pub item_id: String,
    pub item_index: usize,
    pub result: JobOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub job_id: String,
    pub status: BatchStatus,
    pub items: Vec<ItemOutcome>,
}

impl BatchReport {
    pub fn new(job_id: impl Into<String>, items: Vec<ItemOutcome>) -> Self {
        let status = if items.iter().all(|i| i.result.is_success()) {
            BatchStatus::Success
        } else if items
            .iter()
            .all(|i| matches!(i.result, JobOutcome::Cancelled { .. }))
        {
            BatchStatus::Cancelled
        } else {
            BatchStatus::Partial
        };
        Self {
            job_id: job_id.into(),
            status,
            items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cancelled(id: &str) -> ItemOutcome {
        ItemOutcome {
            item_id: id.to_string(),
            item_index: 0,
            result: JobOutcome::Cancelled {
                job_id: "job".to_string(),
                item_id: Some(id.to_string()),
                stage: Stage::Staging,
                timings: Timings::default(),
            },
        }
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let mut timings = Timings::default();
        timings.record(Stage::Staging, 12);
        timings.record(Stage::Staging, 3);
        timings.total_ms = 40;
        let outcome = JobOutcome::Cancelled {
            job_id: "job-9".to_string(),
            item_id: None,
            stage: Stage::Generating,
            timings,
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(
            value,
            json!({
                "status": "cancelled",
                "job_id": "job-9",
                "stage": "generating",
                "timings": { "staging_ms": 15, "total_ms": 40 }
            })
        );
    }

    #[test]
    fn test_batch_status_rollup() {
        assert_eq!(
            BatchReport::new("job", vec![cancelled("a"), cancelled("b")]).status,
            BatchStatus::Cancelled
        );
        let mut mixed = vec![cancelled("a")];
        mixed.push(ItemOutcome {
            item_id: "b".to_string(),
            item_index: 1,
            result: JobOutcome::Error {
                job_id: "job".to_string(),
                item_id: Some("b".to_string()),
                error: ErrorRecord {
                    code: ErrorCode::OutOfMemory,
                    message: "oom".to_string(),
                    retryable: false,
                    stage: Stage::Generating,
                    cause: ErrorCause {
                        class: CauseClass::ResourceExhausted,
                        detail: "oom".to_string(),
                    },
                },
                diagnostics: Diagnostics::default(),
                timings: Timings::default(),
            },
        });
        assert_eq!(BatchReport::new("job", mixed).status, BatchStatus::Partial);
    }
}
