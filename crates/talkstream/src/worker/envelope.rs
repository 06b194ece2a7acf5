use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::job::{BatchReport, JobOutcome};

/// One unit of work handed to the worker: `{id?, input, deadline_ms?}`, or a
/// bare payload that is itself the input.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEnvelope {
    pub id: String,
    pub input: Value,
    pub deadline: Option<Duration>,
}

impl JobEnvelope {
    pub fn parse(value: Value) -> Self {
        let wrapped = value.get("input").is_some_and(Value::is_object);
        let id = value
            .get("id")
            .and_then(|id| match id {
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if !wrapped {
            return Self {
                id,
                input: value,
                deadline: None,
            };
        }

        let deadline = value
            .get("deadline_ms")
            .and_then(Value::as_u64)
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);
        let input = match value {
            Value::Object(mut map) => map.remove("input").unwrap_or(Value::Null),
            _ => Value::Null,
        };

        Self {
            id,
            input,
            deadline,
        }
    }
}

/// What the worker returns for one envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum WorkerResponse {
    Single(JobOutcome),
    Batch(BatchReport),
}

impl WorkerResponse {
    pub fn status_label(&self) -> &'static str {
        match self {
            WorkerResponse::Single(outcome) => outcome.status_label(),
            WorkerResponse::Batch(report) => match report.status {
                crate::job::BatchStatus::Success => "success",
                crate::job::BatchStatus::Partial => "partial",
                crate::job::BatchStatus::Cancelled => "cancelled",
            },
        }
    }
}
