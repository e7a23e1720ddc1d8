//! Compare a finished destination tree against its source.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Fingerprint {
    Directory,
    File(blake3::Hash),
    Symlink(PathBuf),
    Other,
}

/// Relative paths that differ between two trees.
#[derive(Debug, Default, Clone, Serialize)]
pub struct TreeDiff {
    pub missing: Vec<PathBuf>,
    pub extra: Vec<PathBuf>,
    pub mismatched: Vec<PathBuf>,
}

impl TreeDiff {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty() && self.mismatched.is_empty()
    }
}

pub fn compare_trees(source: &Path, destination: &Path) -> Result<TreeDiff> {
    let source_prints = fingerprint_tree(source)?;
    let mut destination_prints = fingerprint_tree(destination)?;

    let mut diff = TreeDiff::default();
    for (path, print) in source_prints {
        match destination_prints.remove(&path) {
            None => diff.missing.push(path),
            Some(other) if other != print => diff.mismatched.push(path),
            Some(_) => {}
        }
    }
    diff.extra = destination_prints.into_keys().collect();
    Ok(diff)
}

fn fingerprint_tree(root: &Path) -> Result<BTreeMap<PathBuf, Fingerprint>> {
    let mut prints = BTreeMap::new();
    for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("{} escaped {}", entry.path().display(), root.display()))?
            .to_path_buf();

        let file_type = entry.file_type();
        let print = if file_type.is_dir() {
            Fingerprint::Directory
        } else if file_type.is_symlink() {
            Fingerprint::Symlink(std::fs::read_link(entry.path())?)
        } else if file_type.is_file() {
            Fingerprint::File(hash_file(entry.path())?)
        } else {
            Fingerprint::Other
        };
        prints.insert(relative, print);
    }
    Ok(prints)
}

fn hash_file(path: &Path) -> Result<blake3::Hash> {
    let mut file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut file, &mut hasher).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_identical_trees_are_clean() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        for root in [a.path(), b.path()] {
            fs::create_dir(root.join("sub")).unwrap();
            fs::write(root.join("sub/file"), b"same").unwrap();
        }
        assert!(compare_trees(a.path(), b.path()).unwrap().is_clean());
    }

    #[test]
    fn test_differences_are_classified() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        fs::write(a.path().join("only-source"), b"x").unwrap();
        fs::write(b.path().join("only-destination"), b"x").unwrap();
        fs::write(a.path().join("changed"), b"old").unwrap();
        fs::write(b.path().join("changed"), b"new").unwrap();

        let diff = compare_trees(a.path(), b.path()).unwrap();
        assert_eq!(diff.missing, vec![PathBuf::from("only-source")]);
        assert_eq!(diff.extra, vec![PathBuf::from("only-destination")]);
        assert_eq!(diff.mismatched, vec![PathBuf::from("changed")]);
        assert!(!diff.is_clean());
    }

    #[test]
    fn test_file_versus_directory_is_a_mismatch() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        fs::create_dir(a.path().join("thing")).unwrap();
        fs::write(b.path().join("thing"), b"").unwrap();
        let diff = compare_trees(a.path(), b.path()).unwrap();
        assert_eq!(diff.mismatched, vec![PathBuf::from("thing")]);
    }
}
