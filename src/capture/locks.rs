//! Per-name wait/notify table.
//!
//! Every handler and the copier hold the names they operate on for the whole
//! of the source call plus its destination mirror. A rename of `A` therefore
//! waits for an in-flight create of `A` to materialize its destination
//! counterpart before it proceeds.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{BackupError, Result};

#[derive(Debug, Default)]
struct Table {
    held: HashSet<PathBuf>,
    waiting: usize,
}

#[derive(Debug, Default)]
pub struct NameLocks {
    table: Mutex<Table>,
    released: Condvar,
}

/// Holds a set of names until dropped.
#[derive(Debug)]
pub struct NameGuard<'a> {
    locks: &'a NameLocks,
    names: Vec<PathBuf>,
}

impl NameLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire every name in `names` at once.
    ///
    /// All-or-nothing acquisition means two operations taking overlapping
    /// sets in different orders cannot deadlock. Fails with
    /// [`BackupError::DeadlockTimeout`] once `timeout` has elapsed.
    pub fn acquire(&self, names: &[&Path], timeout: Duration) -> Result<NameGuard<'_>> {
        let mut wanted: Vec<PathBuf> = names.iter().map(|p| p.to_path_buf()).collect();
        wanted.sort();
        wanted.dedup();

        let started = Instant::now();
        let deadline = started + timeout;
        let mut table = self.table.lock();
        loop {
            let contended = wanted.iter().find(|name| table.held.contains(*name)).cloned();
            let Some(contended) = contended else {
                table.held.extend(wanted.iter().cloned());
                return Ok(NameGuard { locks: self, names: wanted });
            };

            table.waiting += 1;
            let timed_out = self.released.wait_until(&mut table, deadline).timed_out();
            table.waiting -= 1;

            if timed_out && wanted.iter().any(|name| table.held.contains(name)) {
                return Err(BackupError::DeadlockTimeout {
                    path: contended,
                    waited: started.elapsed(),
                });
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_held(&self, name: &Path) -> bool {
        self.table.lock().held.contains(name)
    }

    /// Threads currently parked waiting for a name.
    pub fn waiting(&self) -> usize {
        self.table.lock().waiting
    }
}

impl NameGuard<'_> {
    pub fn names(&self) -> &[PathBuf] {
        &self.names
    }
}

impl Drop for NameGuard<'_> {
    fn drop(&mut self) {
        let mut table = self.locks.table.lock();
        for name in &self.names {
            table.held.remove(name);
        }
        drop(table);
        self.locks.released.notify_all();
    }
}
