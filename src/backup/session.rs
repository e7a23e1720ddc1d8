use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capture::locks::{NameGuard, NameLocks};
use crate::capture::paths::PathTranslator;
use crate::capture::state::CaptureState;
use crate::error::Result;
use crate::utils::journal::{Journal, JournalEntry};

/// State shared by the copier and every admitted handler for one backup run.
pub struct ActiveSession {
    pub(crate) id: Uuid,
    pub(crate) paths: PathTranslator,
    pub(crate) capture: CaptureState,
    pub(crate) names: NameLocks,
    /// Shared by per-object work, exclusive for directory renames.
    pub(crate) namespace: RwLock<()>,
    pub(crate) stats: SessionStats,
    pub(crate) journal: Journal,
    pub(crate) wait_timeout: Duration,
    pub(crate) copy_bytes_per_sec: u64,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl ActiveSession {
    pub(crate) fn new(
        paths: PathTranslator,
        wait_timeout: Duration,
        copy_bytes_per_sec: u64,
        journal_entries: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            paths,
            capture: CaptureState::new(),
            names: NameLocks::new(),
            namespace: RwLock::new(()),
            stats: SessionStats::default(),
            journal: Journal::new(journal_entries),
            wait_timeout,
            copy_bytes_per_sec,
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn lock_names(&self, names: &[&Path]) -> Result<NameGuard<'_>> {
        self.names.acquire(names, self.wait_timeout)
    }

    pub(crate) fn namespace_shared(&self) -> RwLockReadGuard<'_, ()> {
        self.namespace.read()
    }

    pub(crate) fn namespace_exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.namespace.write()
    }

    pub(crate) fn report(&self) -> SessionReport {
        SessionReport {
            session_id: self.id,
            source_root: self.paths.source_root().to_path_buf(),
            destination_root: self.paths.destination_root().to_path_buf(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            duration_ms: self.started.elapsed().as_millis() as u64,
            stats: self.stats.snapshot(),
            visited_objects: self.capture.len(),
            recent_operations: self.journal.entries(Some(100)),
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionStats {
    files_copied: AtomicU64,
    dirs_copied: AtomicU64,
    symlinks_copied: AtomicU64,
    bytes_copied: AtomicU64,
    mirrored_ops: AtomicU64,
    vanished: AtomicU64,
}

impl SessionStats {
    pub(crate) fn file_copied(&self, bytes: u64) {
        self.files_copied.fetch_add(1, Ordering::Relaxed);
        self.bytes_copied.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn dir_copied(&self) {
        self.dirs_copied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn symlink_copied(&self) {
        self.symlinks_copied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn mirrored(&self) {
        self.mirrored_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn vanished(&self) {
        self.vanished.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            files_copied: self.files_copied.load(Ordering::Relaxed),
            dirs_copied: self.dirs_copied.load(Ordering::Relaxed),
            symlinks_copied: self.symlinks_copied.load(Ordering::Relaxed),
            bytes_copied: self.bytes_copied.load(Ordering::Relaxed),
            mirrored_ops: self.mirrored_ops.load(Ordering::Relaxed),
            vanished: self.vanished.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub files_copied: u64,
    pub dirs_copied: u64,
    pub symlinks_copied: u64,
    pub bytes_copied: u64,
    /// Destination operations performed by handlers.
    pub mirrored_ops: u64,
    /// Source objects that disappeared before the copier reached them.
    pub vanished: u64,
}

/// Summary returned by a successful `finish`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub source_root: PathBuf,
    pub destination_root: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub stats: StatsSnapshot,
    pub visited_objects: usize,
    pub recent_operations: Vec<JournalEntry>,
}
