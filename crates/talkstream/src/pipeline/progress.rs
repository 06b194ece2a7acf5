use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::broadcast::{JobProgressBroadcaster, ProgressEvent};
use crate::job::{JobItem, Stage};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("progress queue is full")]
    QueueFull,

    #[error("progress queue is closed")]
    Closed,

    #[error("progress delivery failed: {0}")]
    Failed(String),
}

/// Destination for progress events. Delivery must not block.
pub trait ProgressSink: Send + Sync {
    fn deliver(&self, event: &ProgressEvent) -> Result<(), DeliveryError>;
}

/// Sink for unit tests and callers that do not track progress.
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn deliver(&self, _event: &ProgressEvent) -> Result<(), DeliveryError> {
        Ok(())
    }
}

/// Bridges progress events to a broadcast channel.
pub struct BroadcastSink {
    broadcaster: JobProgressBroadcaster,
}

impl BroadcastSink {
    pub fn new(broadcaster: JobProgressBroadcaster) -> Self {
        Self { broadcaster }
    }
}

impl ProgressSink for BroadcastSink {
    fn deliver(&self, event: &ProgressEvent) -> Result<(), DeliveryError> {
        self.broadcaster.send(event.clone());
        Ok(())
    }
}

/// Slow destination fed by [`QueuedSink`]'s reporting task.
#[async_trait]
pub trait DeliveryTarget: Send + Sync {
    async fn send(&self, event: &ProgressEvent) -> Result<(), DeliveryError>;
}

/// POSTs each event as JSON to a webhook.
pub struct WebhookTarget {
    client: reqwest::Client,
    url: String,
}

impl WebhookTarget {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl DeliveryTarget for WebhookTarget {
    async fn send(&self, event: &ProgressEvent) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| DeliveryError::Failed(e.without_url().to_string()))?;
        if !response.status().is_success() {
            return Err(DeliveryError::Failed(format!("HTTP {}", response.status())));
        }
        Ok(())
    }
}

/// Hands events to a bounded queue drained by a background reporting task,
/// so slow targets never stall the pipeline. A full queue rejects the event.
pub struct QueuedSink {
    sender: mpsc::Sender<ProgressEvent>,
}

impl QueuedSink {
    /// Spawns the reporting task. It ends once every sender is dropped and the
    /// queue is drained.
    pub fn spawn(capacity: usize, target: Arc<dyn DeliveryTarget>) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::channel::<ProgressEvent>(capacity.max(1));
        let task = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                if let Err(first) = target.send(&event).await {
                    debug!("Progress delivery failed, retrying once: {}", first);
                    if let Err(e) = target.send(&event).await {
                        warn!(
                            job_id = %event.job_id,
                            stage = %event.stage,
                            "Dropping progress event after retry: {}",
                            e
                        );
                    }
                }
            }
        });
        (Self { sender }, task)
    }
}

impl ProgressSink for QueuedSink {
    fn deliver(&self, event: &ProgressEvent) -> Result<(), DeliveryError> {
        self.sender.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Emitted {
    stage: Stage,
    percent: u8,
}

/// Per-job front end to the progress sinks. Keeps percent non-decreasing,
/// drops events for stages earlier than the last one emitted, and never
/// fails: a sink error is retried once and then logged.
pub struct ProgressEmitter {
    job_id: String,
    item: Option<(String, usize)>,
    sinks: Vec<Arc<dyn ProgressSink>>,
    last: Mutex<Option<Emitted>>,
}

impl ProgressEmitter {
    pub fn new(job_id: impl Into<String>, sinks: Vec<Arc<dyn ProgressSink>>) -> Self {
        Self {
            job_id: job_id.into(),
            item: None,
            sinks,
            last: Mutex::new(None),
        }
    }

    pub fn for_item(mut self, item: &JobItem) -> Self {
        self.item = Some((item.item_id.clone(), item.index));
        self
    }

    /// Last percent delivered, 0 before any event.
    pub fn percent(&self) -> u8 {
        self.last_emitted().map(|e| e.percent).unwrap_or(0)
    }

    fn last_emitted(&self) -> Option<Emitted> {
        match self.last.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Emits a stage event. Returns the event as delivered, or `None` when it
    /// was dropped for belonging to an earlier stage.
    pub fn emit(
        &self,
        stage: Stage,
        percent: u8,
        details: Map<String, Value>,
    ) -> Option<ProgressEvent> {
        let percent = {
            let mut last = match self.last.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let percent = match *last {
                Some(prev) if stage < prev.stage => {
                    debug!(
                        job_id = %self.job_id,
                        "Dropping progress for {} after {}",
                        stage,
                        prev.stage
                    );
                    return None;
                }
                Some(prev) => percent.min(100).max(prev.percent),
                None => percent.min(100),
            };
            *last = Some(Emitted { stage, percent });
            percent
        };

        let event = self.build(stage.label(), percent, details);
        self.deliver(&event);
        Some(event)
    }

    /// Like [`emit`](Self::emit), but skips updates that would repeat the
    /// current stage without moving its percent forward.
    pub fn advance(
        &self,
        stage: Stage,
        percent: u8,
        details: Map<String, Value>,
    ) -> Option<ProgressEvent> {
        if let Some(prev) = self.last_emitted() {
            if prev.stage == stage && percent.min(100) <= prev.percent {
                return None;
            }
        }
        self.emit(stage, percent, details)
    }

    /// Emits a terminal `failed` or `cancelled` event at the last percent.
    pub fn emit_terminal(&self, label: &str, details: Map<String, Value>) -> ProgressEvent {
        let event = self.build(label, self.percent(), details);
        self.deliver(&event);
        event
    }

    fn build(&self, stage: &str, percent: u8, details: Map<String, Value>) -> ProgressEvent {
        let mut event = ProgressEvent::new(&self.job_id, stage, percent);
        if let Some((item_id, index)) = &self.item {
            event.item_id = Some(item_id.clone());
            event.item_index = Some(*index);
        }
        event.details = details;
        event
    }

    fn deliver(&self, event: &ProgressEvent) {
        for sink in &self.sinks {
            if let Err(first) = sink.deliver(event) {
                if let Err(e) = sink.deliver(event) {
                    warn!(
                        job_id = %event.job_id,
                        stage = %event.stage,
                        "Progress delivery failed ({}), retry failed: {}",
                        first,
                        e
                    );
                }
            }
        }
    }
}
