//! Bounded per-plugin log storage.

use std::collections::VecDeque;

use crate::types::LogEntry;

/// Keeps the newest `capacity` entries; older ones fall off the front.
#[derive(Debug)]
pub struct LogRingBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl LogRingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Up to `count` newest entries, oldest first.
    pub fn recent(&self, count: usize) -> Vec<LogEntry> {
        let skip = self.entries.len().saturating_sub(count);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(capacity: usize, count: usize) -> LogRingBuffer {
        let mut buffer = LogRingBuffer::new(capacity);
        for i in 0..count {
            buffer.push(LogEntry::system(format!("line {i}"), "p"));
        }
        buffer
    }

    #[test]
    fn drops_oldest_beyond_capacity() {
        let buffer = filled(2, 5);
        let messages: Vec<_> = buffer.entries().into_iter().map(|entry| entry.message).collect();
        assert_eq!(messages, vec!["line 3", "line 4"]);
    }

    #[test]
    fn recent_returns_the_newest_in_order() {
        let buffer = filled(10, 4);
        let recent: Vec<_> = buffer.recent(2).into_iter().map(|entry| entry.message).collect();
        assert_eq!(recent, vec!["line 2", "line 3"]);
        assert_eq!(buffer.recent(100).len(), 4);
    }

    #[test]
    fn zero_capacity_keeps_one_entry_and_clear_empties() {
        let mut buffer = filled(0, 3);
        assert_eq!(buffer.entries().len(), 1);
        buffer.clear();
        assert!(buffer.entries().is_empty());
    }
}
