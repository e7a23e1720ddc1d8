//! Source-to-destination path mapping.

use std::borrow::Cow;
use std::path::{Component, Path, PathBuf};

use crate::error::{BackupError, Result};

/// Maps paths under the source root onto the destination root.
///
/// Translation is lexical: `.` and `..` components are resolved without
/// touching the filesystem, and prefix checks compare whole components so a
/// sibling such as `/data2` is never treated as living under `/data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTranslator {
    source_root: PathBuf,
    destination_root: PathBuf,
}

impl PathTranslator {
    pub fn new(source_root: impl AsRef<Path>, destination_root: impl AsRef<Path>) -> Self {
        Self {
            source_root: normalize(source_root.as_ref()).into_owned(),
            destination_root: normalize(destination_root.as_ref()).into_owned(),
        }
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn destination_root(&self) -> &Path {
        &self.destination_root
    }

    /// True when `path` is the source root or lives below it.
    pub fn is_under_tree(&self, path: &Path) -> bool {
        path.is_absolute() && normalize(path).starts_with(&self.source_root)
    }

    /// Destination counterpart of a source path.
    pub fn translate(&self, source: &Path) -> Result<PathBuf> {
        let normalized = normalize(source);
        let relative = normalized
            .strip_prefix(&self.source_root)
            .ok()
            .filter(|_| source.is_absolute())
            .ok_or_else(|| BackupError::OutsideTree {
                path: source.to_path_buf(),
            })?;

        if relative.as_os_str().is_empty() {
            Ok(self.destination_root.clone())
        } else {
            Ok(self.destination_root.join(relative))
        }
    }
}

/// Resolve `.` and `..` lexically, borrowing when nothing needs rewriting.
pub(crate) fn normalize(path: &Path) -> Cow<'_, Path> {
    let clean = path
        .components()
        .all(|c| !matches!(c, Component::CurDir | Component::ParentDir));
    if clean {
        return Cow::Borrowed(path);
    }

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // never climb above the root
                if !matches!(out.components().next_back(), Some(Component::RootDir) | None) {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    Cow::Owned(out)
}
