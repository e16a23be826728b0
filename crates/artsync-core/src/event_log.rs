//! Bounded operator event log. Never consulted for control decisions.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ActionResult, EventKind};

/// Default capacity of the per-pair event log.
pub const EVENT_LOG_CAPACITY: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub result: ActionResult,
    pub message: String,
}

/// Ring buffer; the newest entry evicts the oldest once full.
#[derive(Debug, Clone)]
pub struct EventLog {
    entries: VecDeque<EventLogEntry>,
    capacity: usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::with_capacity(EVENT_LOG_CAPACITY)
    }
}

impl EventLog {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(
        &mut self,
        timestamp: DateTime<Utc>,
        kind: EventKind,
        result: ActionResult,
        message: impl Into<String>,
    ) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(EventLogEntry {
            timestamp,
            kind,
            result,
            message: message.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &EventLogEntry> {
        self.entries.iter()
    }

    /// Newest first, at most `limit` entries.
    pub fn recent(&self, limit: usize) -> Vec<EventLogEntry> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn last(&self) -> Option<&EventLogEntry> {
        self.entries.back()
    }
}

/// Render entries newest first as `YYYY-MM-DD HH:MM:SS [type] result: message`.
pub fn render_text(entries: &[EventLogEntry]) -> String {
    if entries.is_empty() {
        return "No events yet".to_string();
    }
    entries
        .iter()
        .map(|e| {
            format!(
                "{} [{}] {}: {}",
                e.timestamp.format("%Y-%m-%d %H:%M:%S"),
                e.kind.as_str(),
                e.result.as_str(),
                e.message
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, sec).unwrap()
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut log = EventLog::with_capacity(3);
        for i in 0..5 {
            log.push(ts(i), EventKind::Drift, ActionResult::Info, format!("drift {i}"));
        }
        assert_eq!(log.len(), 3);
        let messages: Vec<&str> = log.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["drift 2", "drift 3", "drift 4"]);
    }

    #[test]
    fn default_capacity_is_fifty() {
        let mut log = EventLog::default();
        for i in 0..60 {
            log.push(ts(i % 60), EventKind::Wake, ActionResult::Failure, "x");
        }
        assert_eq!(log.len(), EVENT_LOG_CAPACITY);
    }

    #[test]
    fn render_newest_first() {
        let mut log = EventLog::default();
        log.push(ts(1), EventKind::Enforcement, ActionResult::Success, "art on");
        log.push(ts(2), EventKind::Breaker, ActionResult::Failure, "breaker opened");
        let text = render_text(&log.recent(10));
        assert_eq!(
            text,
            "2026-03-01 08:00:02 [breaker] failure: breaker opened\n\
             2026-03-01 08:00:01 [enforcement] success: art on"
        );
    }

    #[test]
    fn render_empty() {
        assert_eq!(render_text(&[]), "No events yet");
    }
}
