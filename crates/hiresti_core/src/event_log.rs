//! Diagnostics event log: a bounded ring of `HH:MM:SS | message` lines

use std::collections::VecDeque;

use chrono::Local;

/// Entries retained for diagnostics views
pub const EVENT_LOG_CAPACITY: usize = 120;

#[derive(Debug, Clone)]
pub struct EventLog {
    entries: VecDeque<String>,
    capacity: usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::with_capacity(EVENT_LOG_CAPACITY)
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `message` stamped with local wall-clock time; returns the line
    pub fn push(&mut self, message: &str) -> String {
        let stamp = Local::now().format("%H:%M:%S").to_string();
        self.push_stamped(&stamp, message)
    }

    pub fn push_stamped(&mut self, stamp: &str, message: &str) -> String {
        let line = format!("{} | {}", stamp, message.trim());
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(line.clone());
        line
    }

    /// Take every entry, oldest first
    pub fn drain(&mut self) -> Vec<String> {
        self.entries.drain(..).collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    /// Last `n` entries, oldest first
    pub fn recent(&self, n: usize) -> Vec<String> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.entries.iter().any(|e| e.contains(needle))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Split a log line into `(time, message)` at the first `" | "`
pub fn parse_entry(line: &str) -> Option<(&str, &str)> {
    line.split_once(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_and_parse() {
        let mut log = EventLog::new();
        let line = log.push("Output: idle -> switching");
        let (time, msg) = parse_entry(&line).unwrap();
        assert_eq!(time.len(), 8);
        assert_eq!(time.matches(':').count(), 2);
        assert_eq!(msg, "Output: idle -> switching");
        assert_eq!(parse_entry("no separator"), None);
    }

    #[test]
    fn test_ring_capacity() {
        let mut log = EventLog::new();
        for i in 0..130 {
            log.push_stamped("00:00:00", &format!("event {}", i));
        }
        assert_eq!(log.len(), EVENT_LOG_CAPACITY);
        assert_eq!(log.entries().next(), Some("00:00:00 | event 10"));
        assert_eq!(log.recent(2), vec!["00:00:00 | event 128", "00:00:00 | event 129"]);
    }

    #[test]
    fn test_drain_empties() {
        let mut log = EventLog::with_capacity(4);
        log.push("a | b");
        assert!(log.contains("a | b"));
        let drained = log.drain();
        assert_eq!(drained.len(), 1);
        assert!(log.is_empty());
        // Message keeps its own separators after the first one
        assert_eq!(parse_entry(&drained[0]).unwrap().1, "a | b");
    }
}
