use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::events::BridgeEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLevel {
    Info,
    Warn,
    Error,
}

/// One user-visible status line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEntry {
    pub at: DateTime<Utc>,
    pub level: StatusLevel,
    pub message: String,
}

impl fmt::Display for StatusEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.at.format("%H:%M:%S"), self.message)
    }
}

/// Timestamped status lines: mirrored to tracing, kept in a ring buffer for
/// the control API and broadcast to subscribers.
#[derive(Clone)]
pub struct StatusLog {
    tx: broadcast::Sender<BridgeEvent>,
    buffer: Arc<RwLock<VecDeque<StatusEntry>>>,
    max_entries: usize,
}

impl StatusLog {
    pub fn new(tx: broadcast::Sender<BridgeEvent>, max_entries: usize) -> Self {
        Self {
            tx,
            buffer: Arc::new(RwLock::new(VecDeque::with_capacity(max_entries))),
            max_entries,
        }
    }

    pub fn info(&self, msg: impl fmt::Display) {
        self.push(StatusLevel::Info, msg.to_string());
    }

    pub fn warn(&self, msg: impl fmt::Display) {
        self.push(StatusLevel::Warn, msg.to_string());
    }

    pub fn error(&self, msg: impl fmt::Display) {
        self.push(StatusLevel::Error, msg.to_string());
    }

    fn push(&self, level: StatusLevel, message: String) {
        let entry = StatusEntry {
            at: Utc::now(),
            level,
            message,
        };
        match level {
            StatusLevel::Info => tracing::info!("{}", entry.message),
            StatusLevel::Warn => tracing::warn!("{}", entry.message),
            StatusLevel::Error => tracing::error!("{}", entry.message),
        }
        if let Ok(mut entries) = self.buffer.write() {
            entries.push_back(entry.clone());
            while entries.len() > self.max_entries {
                entries.pop_front();
            }
        }
        let _ = self.tx.send(BridgeEvent::LogEntry { entry });
    }

    /// Buffered entries, oldest first.
    pub fn entries(&self) -> Vec<StatusEntry> {
        self.buffer
            .read()
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_are_bounded_and_ordered() {
        let (tx, _) = broadcast::channel(8);
        let log = StatusLog::new(tx, 3);
        log.info("a");
        log.warn("b");
        log.error("c");
        log.info("d");
        let entries = log.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "b");
        assert_eq!(entries[0].level, StatusLevel::Warn);
        assert_eq!(entries[2].message, "d");
    }

    #[test]
    fn entries_are_broadcast_as_log_events() {
        let (tx, mut rx) = broadcast::channel(8);
        let log = StatusLog::new(tx, 3);
        log.error("binding died");
        match rx.try_recv().unwrap() {
            BridgeEvent::LogEntry { entry } => {
                assert_eq!(entry.level, StatusLevel::Error);
                let shown = entry.to_string();
                assert!(shown.ends_with(" binding died"), "unexpected: {shown}");
                assert_eq!(&shown[2..3], ":");
            }
            other => panic!("expected log entry, got {other:?}"),
        }
    }
}
