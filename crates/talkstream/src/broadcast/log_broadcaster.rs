//! Structured job log lines, re-broadcast to in-process subscribers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub job_id: String,
    pub event: String,
    pub details: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl LogLine {
    pub fn new(level: &str, job_id: &str, event: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            level: level.to_string(),
            job_id: job_id.to_string(),
            event: event.to_string(),
            details: Map::new(),
            latency_ms: None,
        }
    }
}

#[derive(Clone)]
pub struct LogBroadcaster {
    sender: broadcast::Sender<LogLine>,
}

impl LogBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn send(&self, line: LogLine) {
        // Ignore errors - no active receivers is fine
        let _ = self.sender.send(line);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogLine> {
        self.sender.subscribe()
    }
}

impl Default for LogBroadcaster {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_line_round_trip_through_channel() {
        let broadcaster = LogBroadcaster::new(8);
        let mut rx = broadcaster.subscribe();
        let mut line = LogLine::new("INFO", "job-1", "stage_completed");
        line.latency_ms = Some(12);
        broadcaster.send(line);

        let received = rx.try_recv().unwrap();
        assert_eq!(received.event, "stage_completed");
        let value = serde_json::to_value(&received).unwrap();
        assert_eq!(value["latency_ms"], 12);
        assert_eq!(value["level"], "INFO");
    }
}
