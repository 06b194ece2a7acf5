//! Job state: identity, status machine and the append-only event log.

pub mod outcome;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::pipeline::classify::ErrorCode;
use crate::request::JobSpec;

pub use outcome::{
    ArtifactDescriptor, ArtifactKind, BatchReport, BatchStatus, Checkpoint, Diagnostics,
    ErrorCause, ErrorRecord, ItemOutcome, JobOutcome, Timings, VideoSummary,
};

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Pending,
    Validating,
    Staging,
    Embedding,
    Warmup,
    Generating,
    Muxing,
    Uploading,
    Completed,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Pending => "pending",
            Stage::Validating => "validating",
            Stage::Staging => "staging",
            Stage::Embedding => "embedding",
            Stage::Warmup => "warmup",
            Stage::Generating => "generating",
            Stage::Muxing => "muxing",
            Stage::Uploading => "uploading",
            Stage::Completed => "completed",
        }
    }

    /// The stage that follows this one, `None` once completed.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Pending => Some(Stage::Validating),
            Stage::Validating => Some(Stage::Staging),
            Stage::Staging => Some(Stage::Embedding),
            Stage::Embedding => Some(Stage::Warmup),
            Stage::Warmup => Some(Stage::Generating),
            Stage::Generating => Some(Stage::Muxing),
            Stage::Muxing => Some(Stage::Uploading),
            Stage::Uploading => Some(Stage::Completed),
            Stage::Completed => None,
        }
    }

    /// Overall percent range covered by this stage.
    pub fn band(&self) -> (u8, u8) {
        match self {
            Stage::Pending => (0, 0),
            Stage::Validating => (2, 2),
            Stage::Staging => (5, 12),
            Stage::Embedding => (14, 18),
            Stage::Warmup => (19, 19),
            Stage::Generating => (20, 88),
            Stage::Muxing => (90, 90),
            Stage::Uploading => (94, 94),
            Stage::Completed => (100, 100),
        }
    }

    /// Maps a fraction of this stage's work onto the overall percent scale.
    pub fn percent_at(&self, fraction: f64) -> u8 {
        let (start, end) = self.band();
        let fraction = fraction.clamp(0.0, 1.0);
        let span = f64::from(end - start);
        start + (span * fraction).floor() as u8
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Stage { stage: Stage },
    Failed { code: ErrorCode, stage: Stage },
    Cancelled { stage: Stage },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Stage { stage } if *stage != Stage::Completed)
    }

    /// Stage the job is in, or was in when it terminated.
    pub fn stage(&self) -> Stage {
        match self {
            JobStatus::Stage { stage }
            | JobStatus::Failed { stage, .. }
            | JobStatus::Cancelled { stage } => *stage,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::Stage { stage } => stage.label(),
            JobStatus::Failed { .. } => "failed",
            JobStatus::Cancelled { .. } => "cancelled",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Illegal status transition from {from} to {to}")]
pub struct TransitionError {
    pub from: &'static str,
    pub to: &'static str,
}

/// Batch membership of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobItem {
    pub item_id: String,
    pub index: usize,
    pub parent_job_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageEvent {
    pub stage: Stage,
    pub percent: u8,
    pub timestamp: DateTime<Utc>,
    pub details: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl StageEvent {
    pub fn new(stage: Stage, percent: u8) -> Self {
        Self {
            stage,
            percent: percent.min(100),
            timestamp: Utc::now(),
            details: Map::new(),
            latency_ms: None,
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }
}

/// A single unit of work owned by one pipeline run.
#[derive(Debug)]
pub struct Job {
    pub id: String,
    pub correlation_id: String,
    pub raw: Value,
    pub spec: JobSpec,
    pub item: Option<JobItem>,
    pub created_at: DateTime<Utc>,
    status: JobStatus,
    events: Vec<StageEvent>,
}

impl Job {
    pub fn new(id: impl Into<String>, raw: Value, spec: JobSpec) -> Self {
        Self {
            id: id.into(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
            raw,
            spec,
            item: None,
            created_at: Utc::now(),
            status: JobStatus::Stage {
                stage: Stage::Pending,
            },
            events: Vec::new(),
        }
    }

    pub fn with_correlation_id(mut self, cid: impl Into<String>) -> Self {
        self.correlation_id = cid.into();
        self
    }

    pub fn with_item(mut self, item: JobItem) -> Self {
        self.item = Some(item);
        self
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn events(&self) -> &[StageEvent] {
        &self.events
    }

    pub fn item_id(&self) -> Option<&str> {
        self.item.as_ref().map(|i| i.item_id.as_str())
    }

    /// Workspace/label suffix: `<job_id>` or `<job_id>-<item_id>`.
    pub fn scoped_id(&self) -> String {
        match &self.item {
            Some(item) => format!("{}-{}", self.id, item.item_id),
            None => self.id.clone(),
        }
    }

    /// Moves the job to `next`. Stages advance strictly one at a time and
    /// nothing leaves a terminal status.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), TransitionError> {
        let current = self.status;
        let allowed = match (current, next) {
            _ if current.is_terminal() => false,
            (JobStatus::Stage { stage: from }, JobStatus::Stage { stage: to }) => {
                from.next() == Some(to)
            }
            (JobStatus::Stage { stage: from }, JobStatus::Failed { stage, .. })
            | (JobStatus::Stage { stage: from }, JobStatus::Cancelled { stage }) => from == stage,
            _ => false,
        };

        if !allowed {
            return Err(TransitionError {
                from: current.label(),
                to: next.label(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Appends an event, clamping its percent so the log never decreases.
    pub fn record(&mut self, mut event: StageEvent) -> &StageEvent {
        if let Some(last) = self.events.last() {
            event.percent = event.percent.max(last.percent);
        }
        if let Some(item) = &self.item {
            event
                .details
                .insert("item_id".to_string(), Value::from(item.item_id.clone()));
            event
                .details
                .insert("item_index".to_string(), Value::from(item.index));
        }
        self.events.push(event);
        &self.events[self.events.len() - 1]
    }

    /// Percent of the most recent event, 0 before any.
    pub fn percent(&self) -> u8 {
        self.events.last().map(|e| e.percent).unwrap_or(0)
    }
}
