//! Which source objects the session has already visited.

use std::collections::HashMap;
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::backup::Operation;

/// Stable identity of a filesystem object.
///
/// On Unix this is the device and inode pair, which survives renames. Other
/// platforms fall back to the path and rely on [`CaptureState::rekey`] when
/// the object is renamed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ObjectId {
    Inode { dev: u64, ino: u64 },
    Path(PathBuf),
}

impl ObjectId {
    #[cfg(unix)]
    pub fn from_metadata(_path: &Path, metadata: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        ObjectId::Inode {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }

    #[cfg(not(unix))]
    pub fn from_metadata(path: &Path, _metadata: &Metadata) -> Self {
        ObjectId::Path(path.to_path_buf())
    }

    /// Identity of the object currently at `path`, without following symlinks.
    pub fn probe(path: &Path) -> io::Result<Self> {
        let metadata = std::fs::symlink_metadata(path)?;
        Ok(Self::from_metadata(path, &metadata))
    }
}

/// Who visited an object first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visitor {
    Copier,
    Handler(Operation),
}

#[derive(Debug, Clone)]
pub struct CaptureRecord {
    pub visitor: Visitor,
    pub visited_at: Instant,
}

/// Linearizable visited-set shared by the copier and the handlers.
#[derive(Debug, Default)]
pub struct CaptureState {
    records: Mutex<HashMap<ObjectId, CaptureRecord>>,
    lookups: AtomicU64,
}

impl CaptureState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a visit. Returns false if the object was already visited.
    pub fn mark_visited(&self, id: ObjectId, visitor: Visitor) -> bool {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let mut records = self.records.lock();
        if records.contains_key(&id) {
            return false;
        }
        records.insert(
            id,
            CaptureRecord {
                visitor,
                visited_at: Instant::now(),
            },
        );
        true
    }

    pub fn is_visited(&self, id: &ObjectId) -> bool {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.records.lock().contains_key(id)
    }

    #[cfg(test)]
    pub(crate) fn record(&self, id: &ObjectId) -> Option<CaptureRecord> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.records.lock().get(id).cloned()
    }

    /// Drop the record of an object that no longer exists, so a recycled
    /// inode number is not mistaken for it.
    pub fn forget(&self, id: &ObjectId) -> bool {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.records.lock().remove(id).is_some()
    }

    /// Move a path-keyed record to its new name. Inode keys are left alone.
    pub fn rekey(&self, from: &ObjectId, to: ObjectId) {
        if from == &to || !matches!(from, ObjectId::Path(_)) {
            return;
        }
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let mut records = self.records.lock();
        if let Some(record) = records.remove(from) {
            records.insert(to, record);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }

    /// Number of queries and updates made so far.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn inode(ino: u64) -> ObjectId {
        ObjectId::Inode { dev: 1, ino }
    }

    #[test]
    fn test_mark_visited_once() {
        let state = CaptureState::new();
        assert!(!state.is_visited(&inode(7)));
        assert!(state.mark_visited(inode(7), Visitor::Copier));
        assert!(!state.mark_visited(inode(7), Visitor::Handler(Operation::Create)));
        assert!(state.is_visited(&inode(7)));
        assert_eq!(state.record(&inode(7)).unwrap().visitor, Visitor::Copier);
    }

    #[test]
    fn test_forget_clears_record() {
        let state = CaptureState::new();
        state.mark_visited(inode(3), Visitor::Copier);
        assert!(state.forget(&inode(3)));
        assert!(!state.is_visited(&inode(3)));
        assert!(!state.forget(&inode(3)));
    }

    #[test]
    fn test_rekey_moves_path_records_only() {
        let state = CaptureState::new();
        let old = ObjectId::Path(PathBuf::from("/s/a"));
        let new = ObjectId::Path(PathBuf::from("/s/b"));
        state.mark_visited(old.clone(), Visitor::Copier);
        state.rekey(&old, new.clone());
        assert!(!state.is_visited(&old));
        assert!(state.is_visited(&new));

        state.mark_visited(inode(9), Visitor::Copier);
        state.rekey(&inode(9), inode(10));
        assert!(state.is_visited(&inode(9)));
    }

    #[test]
    fn test_lookups_are_counted() {
        let state = CaptureState::new();
        let before = state.lookups();
        state.is_visited(&inode(1));
        state.mark_visited(inode(1), Visitor::Copier);
        assert_eq!(state.lookups(), before + 2);
    }

    #[test]
    fn test_visits_from_many_threads_are_not_duplicated() {
        let state = Arc::new(CaptureState::new());
        let winners: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let state = state.clone();
                    s.spawn(move || (0..100).filter(|i| state.mark_visited(inode(*i), Visitor::Copier)).count())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(winners, 100);
        assert_eq!(state.len(), 100);
    }

    #[test]
    fn test_probe_identity_survives_rename() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"x").unwrap();
        let before = ObjectId::probe(&a).unwrap();
        std::fs::rename(&a, &b).unwrap();
        let after = ObjectId::probe(&b).unwrap();
        if cfg!(unix) {
            assert_eq!(before, after);
        }
    }
}
