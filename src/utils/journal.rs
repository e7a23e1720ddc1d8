use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;

use crate::backup::Operation;

#[derive(Debug, Clone, Serialize)]
pub struct JournalEntry {
    pub timestamp: i64,
    pub operation: Operation,
    pub path: PathBuf,
    pub detail: Option<String>,
}

/// Bounded record of the most recent destination-side operations.
#[derive(Clone)]
pub struct Journal {
    buffer: Arc<Mutex<VecDeque<JournalEntry>>>,
    max_entries: usize,
}

impl Journal {
    pub fn new(max_entries: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(max_entries.min(4096)))),
            max_entries,
        }
    }

    pub fn record(&self, operation: Operation, path: &Path, detail: Option<String>) {
        if self.max_entries == 0 {
            return;
        }
        let entry = JournalEntry {
            timestamp: Utc::now().timestamp(),
            operation,
            path: path.to_path_buf(),
            detail,
        };

        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.max_entries {
            buffer.pop_front();
        }
        buffer.push_back(entry);
    }

    /// Oldest-first entries, limited to the newest `limit` when given.
    pub fn entries(&self, limit: Option<usize>) -> Vec<JournalEntry> {
        let buffer = self.buffer.lock();
        let skip = limit.map_or(0, |n| buffer.len().saturating_sub(n));
        buffer.iter().skip(skip).cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oldest_entries_are_evicted() {
        let journal = Journal::new(2);
        journal.record(Operation::Create, Path::new("/a"), None);
        journal.record(Operation::Write, Path::new("/b"), None);
        journal.record(Operation::Rename, Path::new("/c"), Some("to /d".into()));
        let entries = journal.entries(None);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, PathBuf::from("/b"));
        assert_eq!(entries[1].detail.as_deref(), Some("to /d"));
    }

    #[test]
    fn test_limit_returns_newest() {
        let journal = Journal::new(10);
        for name in ["/a", "/b", "/c"] {
            journal.record(Operation::Mkdir, Path::new(name), None);
        }
        let newest = journal.entries(Some(1));
        assert_eq!(newest.len(), 1);
        assert_eq!(newest[0].path, PathBuf::from("/c"));
    }

    #[test]
    fn test_zero_capacity_records_nothing() {
        let journal = Journal::new(0);
        journal.record(Operation::Unlink, Path::new("/a"), None);
        assert!(journal.is_empty());
    }
}
