use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::config::LOG_BUFFER_SIZE;

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub source: LogSource,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Orchestrator,
    Judge,
    Store,
    Server,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
}

/// Bounded in-process event log with live fan-out to subscribers.
pub struct LogState {
    buffer: Arc<RwLock<VecDeque<LogEntry>>>,
    sender: broadcast::Sender<LogEntry>,
}

impl Default for LogState {
    fn default() -> Self {
        Self::new()
    }
}

impl LogState {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            buffer: Arc::new(RwLock::new(VecDeque::with_capacity(LOG_BUFFER_SIZE))),
            sender,
        }
    }

    pub async fn push(&self, entry: LogEntry) {
        let mut buf = self.buffer.write().await;
        if buf.len() >= LOG_BUFFER_SIZE {
            buf.pop_front();
        }
        buf.push_back(entry.clone());
        drop(buf);

        let _ = self.sender.send(entry);
    }

    pub async fn history(&self) -> Vec<LogEntry> {
        self.buffer.read().await.iter().cloned().collect()
    }

    /// Up to `limit` entries, newest first, optionally from one source.
    pub async fn recent(&self, limit: usize, source: Option<&LogSource>) -> Vec<LogEntry> {
        self.buffer
            .read()
            .await
            .iter()
            .rev()
            .filter(|e| source.is_none_or(|s| *s == e.source))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.sender.subscribe()
    }

    pub async fn emit(&self, source: LogSource, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            source,
            level,
            message: message.into(),
        };
        self.push(entry).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_buffer_is_bounded() {
        let logs = LogState::new();
        for i in 0..(LOG_BUFFER_SIZE + 10) {
            logs.emit(LogSource::Orchestrator, LogLevel::Info, format!("entry {}", i))
                .await;
        }
        let history = logs.history().await;
        assert_eq!(history.len(), LOG_BUFFER_SIZE);
        assert_eq!(history[0].message, "entry 10");
    }

    #[tokio::test]
    async fn test_subscribers_receive_entries() {
        let logs = LogState::new();
        let mut rx = logs.subscribe();
        logs.emit(LogSource::Judge, LogLevel::Warn, "judge reply unparseable")
            .await;
        let entry = rx.try_recv().unwrap();
        assert_eq!(entry.source, LogSource::Judge);
        assert_eq!(entry.level, LogLevel::Warn);
    }

    #[tokio::test]
    async fn test_recent_filters_by_source_newest_first() {
        let logs = LogState::new();
        logs.emit(LogSource::Orchestrator, LogLevel::Info, "run 1 started")
            .await;
        logs.emit(LogSource::Store, LogLevel::Info, "evaluation deleted")
            .await;
        logs.emit(LogSource::Orchestrator, LogLevel::Info, "run 1 completed")
            .await;

        let recent = logs.recent(10, Some(&LogSource::Orchestrator)).await;
        let messages: Vec<_> = recent.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["run 1 completed", "run 1 started"]);

        assert_eq!(logs.recent(1, None).await[0].message, "run 1 completed");
    }
}
