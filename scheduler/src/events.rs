//! Outbound notifications and the user-facing log

use crate::device::WeatherStatus;
use crate::job::JobState;
use crate::session::SchedulerState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Event emitted by the scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SchedulerEvent {
    Log { timestamp: DateTime<Utc>, message: String },
    StateChanged(SchedulerState),
    JobListChanged,
    JobStateChanged { id: Uuid, name: String, state: JobState },
    Sleeping { until: DateTime<Utc> },
    WeatherChanged(WeatherStatus),
    ShutdownStarted,
    Stopped,
}

/// One user-facing log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Most recent log lines, oldest first
#[derive(Debug, Clone)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&LogEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.entries.iter().any(|e| e.message.contains(needle))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Log sink plus event broadcaster shared by every scheduler component
pub struct EventSink {
    log: LogBuffer,
    event_tx: broadcast::Sender<SchedulerEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            log: LogBuffer::new(capacity),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_tx.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<SchedulerEvent> {
        self.event_tx.clone()
    }

    pub fn emit(&self, event: SchedulerEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Append a user-visible message, mirrored to tracing
    pub fn append_log(&mut self, timestamp: DateTime<Utc>, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{}", message);
        self.log.push(LogEntry {
            timestamp,
            message: message.clone(),
        });
        self.emit(SchedulerEvent::Log { timestamp, message });
    }

    pub fn log(&self) -> &LogBuffer {
        &self.log
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(n: usize) -> LogEntry {
        LogEntry {
            timestamp: Utc.with_ymd_and_hms(2021, 4, 17, 7, 0, 0).unwrap(),
            message: format!("message {}", n),
        }
    }

    #[test]
    fn test_log_buffer_caps_entries() {
        let mut buffer = LogBuffer::new(3);
        for n in 0..5 {
            buffer.push(entry(n));
        }
        assert_eq!(buffer.len(), 3);
        let messages: Vec<_> = buffer.entries().map(|e| e.message.clone()).collect();
        assert_eq!(messages, vec!["message 2", "message 3", "message 4"]);
    }

    #[tokio::test]
    async fn test_append_log_broadcasts() {
        let mut sink = EventSink::new(10);
        let mut rx = sink.subscribe();
        let ts = Utc.with_ymd_and_hms(2021, 4, 17, 7, 0, 0).unwrap();

        sink.append_log(ts, "Scheduler started.");

        match rx.recv().await.unwrap() {
            SchedulerEvent::Log { message, .. } => assert_eq!(message, "Scheduler started."),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(sink.log().contains("started"));
    }
}
