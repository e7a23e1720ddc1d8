//! Open files known to the interceptor.
//!
//! The table lives for the whole process, not a single session, so a file
//! opened before a backup starts can still have its writes mirrored once
//! the copier has visited it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorId(u64);

impl DescriptorId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

#[derive(Debug)]
struct Descriptor {
    path: PathBuf,
    unlinked: bool,
}

#[derive(Debug, Default)]
pub struct DescriptorTable {
    next: AtomicU64,
    entries: Mutex<HashMap<DescriptorId, Descriptor>>,
}

impl DescriptorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, path: &Path) -> DescriptorId {
        let id = DescriptorId(self.next.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().insert(
            id,
            Descriptor {
                path: path.to_path_buf(),
                unlinked: false,
            },
        );
        id
    }

    /// Current source path of a descriptor; `None` once its name was unlinked.
    pub fn path_of(&self, id: DescriptorId) -> Option<PathBuf> {
        self.entries
            .lock()
            .get(&id)
            .filter(|d| !d.unlinked)
            .map(|d| d.path.clone())
    }

    pub fn release(&self, id: DescriptorId) -> bool {
        self.entries.lock().remove(&id).is_some()
    }

    /// Re-point descriptors at `from` (or below it, for directories) to `to`.
    pub fn renamed(&self, from: &Path, to: &Path) {
        let mut entries = self.entries.lock();
        for descriptor in entries.values_mut() {
            if descriptor.unlinked {
                continue;
            }
            if let Ok(rest) = descriptor.path.strip_prefix(from) {
                descriptor.path = if rest.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(rest)
                };
            } else if descriptor.path == to {
                // the rename replaced the object this descriptor named
                descriptor.unlinked = true;
            }
        }
    }

    pub fn unlinked(&self, path: &Path) {
        let mut entries = self.entries.lock();
        for descriptor in entries.values_mut().filter(|d| d.path == path) {
            descriptor.unlinked = true;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
