//! Events the pipeline reports to whatever renders it.
//! Every log entry is also mirrored into `tracing`.

use crate::queue::{JobId, JobStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One line of the running log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BannerKind {
    Info,
    Error,
    Success,
}

/// The single terminal notification of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Banner {
    pub kind: BannerKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Log(LogEntry),
    Status { job: JobId, status: JobStatus },
    Progress { job: JobId, current: usize, total: usize },
    /// Streamed characters received so far for the chunk in flight.
    Partial { job: JobId, chunk: usize, received: usize },
    Banner(Banner),
}

/// Cheap handle for emitting events; a sink without a receiver only logs.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<UnboundedSender<QueueEvent>>,
}

impl EventSink {
    pub fn new(tx: UnboundedSender<QueueEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: QueueEvent) {
        if let Some(tx) = &self.tx {
            // A dropped receiver just means nobody is watching anymore.
            let _ = tx.send(event);
        }
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => info!("{message}"),
            LogLevel::Warn => warn!("{message}"),
            LogLevel::Error => error!("{message}"),
        }
        self.emit(QueueEvent::Log(LogEntry {
            level,
            message,
            timestamp: Utc::now(),
        }));
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    pub fn banner(&self, kind: BannerKind, message: impl Into<String>) {
        self.emit(QueueEvent::Banner(Banner {
            kind,
            message: message.into(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn log_entries_reach_the_receiver_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(tx);
        sink.info("first");
        sink.warn("second");
        sink.banner(BannerKind::Success, "done");
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen.len(), 3);
        assert!(matches!(&seen[0], QueueEvent::Log(e) if e.level == LogLevel::Info && e.message == "first"));
        assert!(matches!(&seen[1], QueueEvent::Log(e) if e.level == LogLevel::Warn));
        assert!(matches!(&seen[2], QueueEvent::Banner(b) if b.kind == BannerKind::Success));
    }

    #[test]
    fn disabled_sink_does_not_panic() {
        let sink = EventSink::disabled();
        sink.error("nobody listening");
    }
}
