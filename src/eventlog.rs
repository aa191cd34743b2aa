// User-visible event log
// The last few notices, each stamped with the estimated sender time

use std::collections::VecDeque;
use std::fmt;
use tracing::{error, info, warn};

use crate::constants::EVENT_LOG_DEPTH;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Notice,
    Warning,
    Error,
    /// Connection state changes
    Link,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Notice => "notice",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Link => "link",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Estimated sender time; None before the first timestamped packet
    pub stamp: Option<f64>,
    pub level: LogLevel,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stamp {
            Some(t) => write!(f, "{:.1}s {}", t, self.message),
            None => write!(f, "? {}", self.message),
        }
    }
}

/// Bounded log panel; every entry is mirrored to tracing
#[derive(Debug, Clone)]
pub struct EventLog {
    entries: VecDeque<LogEntry>,
    depth: usize,
}

impl EventLog {
    pub fn new() -> Self {
        Self::with_depth(EVENT_LOG_DEPTH)
    }

    pub fn with_depth(depth: usize) -> Self {
        EventLog {
            entries: VecDeque::with_capacity(depth),
            depth: depth.max(1),
        }
    }

    pub fn push(&mut self, level: LogLevel, message: impl Into<String>, stamp: Option<f64>) {
        let entry = LogEntry { stamp, level, message: message.into() };
        match level {
            LogLevel::Notice | LogLevel::Link => info!("{}", entry),
            LogLevel::Warning => warn!("{}", entry),
            LogLevel::Error => error!("{}", entry),
        }

        if self.entries.len() == self.depth {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> + '_ {
        self.entries.iter()
    }

    pub fn latest(&self) -> Option<&LogEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_is_bounded() {
        let mut log = EventLog::new();
        for i in 0..20 {
            log.push(LogLevel::Notice, format!("line {}", i), None);
        }
        assert_eq!(log.len(), EVENT_LOG_DEPTH);
        assert_eq!(log.entries().next().unwrap().message, "line 4");
        assert_eq!(log.latest().unwrap().message, "line 19");
    }

    #[test]
    fn test_entry_formatting() {
        let mut log = EventLog::with_depth(4);
        log.push(LogLevel::Error, "thermocouple1Error flag raised", Some(12.345));
        log.push(LogLevel::Link, "Connecting", None);

        let lines: Vec<String> = log.entries().map(|e| e.to_string()).collect();
        assert_eq!(lines, vec!["12.3s thermocouple1Error flag raised", "? Connecting"]);
        assert_eq!(log.latest().unwrap().level.as_str(), "link");
    }
}
