//! Tracing setup and the per-job structured logger.

use serde_json::{Map, Value};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

use crate::broadcast::{LogBroadcaster, LogLine};

/// Installs a JSON subscriber on stderr filtered by `RUST_LOG` (falling back
/// to `default_filter`) and bridges `log` records into tracing.
pub fn init_tracing(default_filter: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_filter))?;
    let subscriber = tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(std::io::stderr),
    );
    tracing::subscriber::set_global_default(subscriber)?;
    tracing_log::LogTracer::init()?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// Emits `{job_id, event, details, latency_ms}` log lines through tracing
/// and, when attached, a [`LogBroadcaster`].
#[derive(Clone)]
pub struct JobLogger {
    job_id: String,
    broadcaster: Option<LogBroadcaster>,
}

impl JobLogger {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            broadcaster: None,
        }
    }

    pub fn with_broadcaster(mut self, broadcaster: LogBroadcaster) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn info(&self, event: &str, details: Map<String, Value>, latency_ms: Option<u64>) {
        self.log(LogLevel::Info, event, details, latency_ms);
    }

    pub fn warn(&self, event: &str, details: Map<String, Value>) {
        self.log(LogLevel::Warn, event, details, None);
    }

    pub fn error(&self, event: &str, details: Map<String, Value>, latency_ms: Option<u64>) {
        self.log(LogLevel::Error, event, details, latency_ms);
    }

    pub fn log(
        &self,
        level: LogLevel,
        event: &str,
        details: Map<String, Value>,
        latency_ms: Option<u64>,
    ) {
        let rendered = Value::Object(details.clone());
        match level {
            LogLevel::Info => tracing::info!(
                job_id = %self.job_id,
                event,
                details = %rendered,
                latency_ms,
                "{}",
                event
            ),
            LogLevel::Warn => tracing::warn!(
                job_id = %self.job_id,
                event,
                details = %rendered,
                latency_ms,
                "{}",
                event
            ),
            LogLevel::Error => tracing::error!(
                job_id = %self.job_id,
                event,
                details = %rendered,
                latency_ms,
                "{}",
                event
            ),
        }

        if let Some(broadcaster) = &self.broadcaster {
            let mut line = LogLine::new(level.as_str(), &self.job_id, event);
            line.details = details;
            line.latency_ms = latency_ms;
            broadcaster.send(line);
        }
    }
}
