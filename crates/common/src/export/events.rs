//! Structured progress and log events.
//!
//! Long running jobs report through a channel of [`ExportEvent`]s that the
//!  caller drains, instead of calling back into UI code. Every log entry is
//!  mirrored to `tracing` at the matching level.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Success,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Success => "success",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {:>7} {}",
            self.timestamp.format("%H:%M:%S"),
            self.level,
            self.message
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub current: usize,
    pub total: usize,
    pub stage: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExportEvent {
    Log(LogEntry),
    Progress(Progress),
}

/// Sending half of the event stream. Cheap to clone; a default sink
///  drops events (they still reach `tracing`).
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<flume::Sender<ExportEvent>>,
}

impl EventSink {
    /// Unbounded stream
    pub fn channel() -> (Self, flume::Receiver<ExportEvent>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx: Some(tx) }, rx)
    }

    /// Bounded stream; emitters wait when the caller falls behind
    pub fn bounded(capacity: usize) -> (Self, flume::Receiver<ExportEvent>) {
        let (tx, rx) = flume::bounded(capacity);
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that only logs through `tracing`
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Emit a log entry and hand it back so callers can keep a copy
    pub async fn log(&self, level: LogLevel, message: impl Into<String>) -> LogEntry {
        let entry = LogEntry::new(level, message);
        match entry.level {
            LogLevel::Info | LogLevel::Success => tracing::info!("{}", entry.message),
            LogLevel::Warn => tracing::warn!("{}", entry.message),
            LogLevel::Error => tracing::error!("{}", entry.message),
        }
        self.send(ExportEvent::Log(entry.clone())).await;
        entry
    }

    pub async fn progress(&self, current: usize, total: usize, stage: impl Into<String>) {
        let progress = Progress {
            current,
            total,
            stage: stage.into(),
        };
        tracing::trace!(
            current = progress.current,
            total = progress.total,
            stage = %progress.stage,
            "progress"
        );
        self.send(ExportEvent::Progress(progress)).await;
    }

    async fn send(&self, event: ExportEvent) {
        if let Some(tx) = &self.tx {
            // a caller that stopped listening is not an error for the job
            let _ = tx.send_async(event).await;
        }
    }
}

/// Log entries collected for a job while also being streamed out
#[derive(Debug, Clone, Default)]
pub struct JobLog {
    sink: EventSink,
    entries: Vec<LogEntry>,
}

impl JobLog {
    pub fn new(sink: EventSink) -> Self {
        Self {
            sink,
            entries: Vec::new(),
        }
    }

    pub fn sink(&self) -> &EventSink {
        &self.sink
    }

    pub async fn info(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Info, message).await;
    }

    pub async fn warn(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Warn, message).await;
    }

    pub async fn error(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Error, message).await;
    }

    pub async fn success(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Success, message).await;
    }

    /// Keep entries that were already streamed elsewhere
    pub fn extend(&mut self, entries: impl IntoIterator<Item = LogEntry>) {
        self.entries.extend(entries);
    }

    pub fn into_entries(self) -> Vec<LogEntry> {
        self.entries
    }

    async fn push(&mut self, level: LogLevel, message: impl Into<String>) {
        let entry = self.sink.log(level, message).await;
        self.entries.push(entry);
    }
}
