//! Interception handlers.
//!
//! Every handler performs the real source operation first. When a session is
//! admitting and the paths are under the source root, a successful source
//! operation is mirrored onto the destination while the affected names are
//! locked. Mirror failures abort the session but never change the result the
//! caller sees; source failures are returned as-is and nothing is mirrored.

use crate::backup::copier::{self, CopyFailure};
use crate::backup::manager::Shared;
use crate::backup::session::ActiveSession;
use crate::backup::{Fault, Operation};
use crate::capture::descriptors::DescriptorId;
use crate::capture::locks::NameGuard;
use crate::capture::paths::normalize;
use crate::capture::pause::PausePoint;
use crate::capture::state::{ObjectId, Visitor};
use crate::error::{BackupError, Result};
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Entry point for filesystem operations that a backup must observe.
#[derive(Clone)]
pub struct Interceptor {
    shared: Arc<Shared>,
}

/// Open flags understood by [`Interceptor::open_with`].
#[derive(Debug, Clone, Default)]
pub struct CaptureOptions {
    read: bool,
    write: bool,
    append: bool,
    truncate: bool,
    create: bool,
    create_new: bool,
    mode: Option<u32>,
}

impl CaptureOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&mut self, read: bool) -> &mut Self {
        self.read = read;
        self
    }

    pub fn write(&mut self, write: bool) -> &mut Self {
        self.write = write;
        self
    }

    pub fn append(&mut self, append: bool) -> &mut Self {
        self.append = append;
        self
    }

    pub fn truncate(&mut self, truncate: bool) -> &mut Self {
        self.truncate = truncate;
        self
    }

    pub fn create(&mut self, create: bool) -> &mut Self {
        self.create = create;
        self
    }

    pub fn create_new(&mut self, create_new: bool) -> &mut Self {
        self.create_new = create_new;
        self
    }

    /// Permission bits for newly created files (Unix only).
    pub fn mode(&mut self, mode: u32) -> &mut Self {
        self.mode = Some(mode);
        self
    }

    pub fn open(&self, interceptor: &Interceptor, path: impl AsRef<Path>) -> io::Result<CapturedFile> {
        interceptor.open_with(path, self)
    }

    fn to_std(&self) -> OpenOptions {
        let mut options = OpenOptions::new();
        options
            .read(self.read)
            .write(self.write)
            .append(self.append)
            .truncate(self.truncate)
            .create(self.create)
            .create_new(self.create_new);
        #[cfg(unix)]
        if let Some(mode) = self.mode {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode);
        }
        options
    }
}

enum Mutation<'a> {
    Write { offset: u64, data: &'a [u8] },
    Truncate { len: u64 },
}

/// Holds the namespace shared, or exclusively for directory renames.
struct NamespaceGuard<'a> {
    _shared: Option<RwLockReadGuard<'a, ()>>,
    _exclusive: Option<RwLockWriteGuard<'a, ()>>,
}

impl<'a> NamespaceGuard<'a> {
    fn shared(session: &'a ActiveSession) -> Self {
        Self {
            _shared: Some(session.namespace_shared()),
            _exclusive: None,
        }
    }

    fn exclusive(session: &'a ActiveSession) -> Self {
        Self {
            _shared: None,
            _exclusive: Some(session.namespace_exclusive()),
        }
    }

    /// Lock for a rename of `from`; retried if `from` changes kind meanwhile.
    fn for_rename(session: &'a ActiveSession, from: &Path) -> (Self, bool) {
        loop {
            let is_dir = is_directory(from);
            let guard = if is_dir {
                Self::exclusive(session)
            } else {
                Self::shared(session)
            };
            if is_directory(from) == is_dir {
                return (guard, is_dir);
            }
        }
    }
}

impl Interceptor {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Open (or create) a file with the given flags.
    pub fn open_with(&self, path: impl AsRef<Path>, options: &CaptureOptions) -> io::Result<CapturedFile> {
        let path = resolve(path.as_ref());
        let Some(scope) = self.shared.admit(&[&path]) else {
            let file = options.to_std().open(&path)?;
            return Ok(self.captured(file, &path));
        };
        let session = scope.session();
        let _namespace = NamespaceGuard::shared(session);
        let names = self.lock_or_abort(session, Operation::Open, &[&path]);

        let existed = fs::symlink_metadata(&path).is_ok();
        let file = options.to_std().open(&path)?;

        if names.is_some() {
            let operation = if existed { Operation::Open } else { Operation::Create };
            if let Err(err) = self.mirror_open(session, &path, &file, options, existed) {
                self.fail(operation, &path, &err);
            }
        }
        Ok(self.captured(file, &path))
    }

    /// Create or truncate a file for writing, like [`File::create`].
    pub fn create(&self, path: impl AsRef<Path>) -> io::Result<CapturedFile> {
        CaptureOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self, path)
    }

    /// Open an existing file for reading and writing.
    pub fn open(&self, path: impl AsRef<Path>) -> io::Result<CapturedFile> {
        CaptureOptions::new().read(true).write(true).open(self, path)
    }

    pub fn rename(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> io::Result<()> {
        let from = resolve(from.as_ref());
        let to = resolve(to.as_ref());
        let Some(scope) = self.shared.admit(&[&from, &to]) else {
            fs::rename(&from, &to)?;
            self.shared.descriptors.renamed(&from, &to);
            return Ok(());
        };
        let session = scope.session();
        let (_namespace, is_dir) = NamespaceGuard::for_rename(session, &from);
        let names = self.lock_or_abort(session, Operation::Rename, &[&from, &to]);

        let replaced = ObjectId::probe(&to).ok();
        fs::rename(&from, &to)?;
        self.shared.descriptors.renamed(&from, &to);

        if names.is_some() && from != to {
            if let Err(err) = self.mirror_rename(session, &from, &to, replaced, is_dir) {
                self.fail(Operation::Rename, &from, &err);
            }
        }
        Ok(())
    }

    pub fn remove_file(&self, path: impl AsRef<Path>) -> io::Result<()> {
        self.remove(resolve(path.as_ref()), Operation::Unlink)
    }

    pub fn remove_dir(&self, path: impl AsRef<Path>) -> io::Result<()> {
        self.remove(resolve(path.as_ref()), Operation::Rmdir)
    }

    pub fn create_dir(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let path = resolve(path.as_ref());
        let Some(scope) = self.shared.admit(&[&path]) else {
            return fs::create_dir(&path);
        };
        let session = scope.session();
        let _namespace = NamespaceGuard::shared(session);
        let names = self.lock_or_abort(session, Operation::Mkdir, &[&path]);

        fs::create_dir(&path)?;

        if names.is_some() {
            if let Err(err) = self.mirror_mkdir(session, &path) {
                self.fail(Operation::Mkdir, &path, &err);
            }
        }
        Ok(())
    }

    fn remove(&self, path: PathBuf, operation: Operation) -> io::Result<()> {
        let real = |path: &Path| match operation {
            Operation::Rmdir => fs::remove_dir(path),
            _ => fs::remove_file(path),
        };
        let Some(scope) = self.shared.admit(&[&path]) else {
            real(&path)?;
            self.shared.descriptors.unlinked(&path);
            return Ok(());
        };
        let session = scope.session();
        let _namespace = NamespaceGuard::shared(session);
        let names = self.lock_or_abort(session, operation, &[&path]);

        let victim = ObjectId::probe(&path).ok();
        real(&path)?;
        self.shared.descriptors.unlinked(&path);

        if names.is_some() {
            if let Err(err) = self.mirror_remove(session, &path, victim, operation) {
                self.fail(operation, &path, &err);
            }
        }
        Ok(())
    }

    fn captured(&self, file: File, path: &Path) -> CapturedFile {
        CapturedFile {
            id: self.shared.descriptors.register(path),
            file,
            interceptor: self.clone(),
        }
    }

    fn lock_or_abort<'s>(
        &self,
        session: &'s ActiveSession,
        operation: Operation,
        names: &[&Path],
    ) -> Option<NameGuard<'s>> {
        match session.lock_names(names) {
            Ok(guard) => Some(guard),
            Err(err) => {
                self.fail(operation, names[0], &err);
                None
            }
        }
    }

    fn fail(&self, operation: Operation, path: &Path, err: &BackupError) {
        warn!("Mirroring {} of {} failed: {}", operation, path.display(), err);
        self.shared.abort(Fault::from_error(operation, path, err));
    }

    fn mirror_open(
        &self,
        session: &ActiveSession,
        path: &Path,
        file: &File,
        options: &CaptureOptions,
        existed: bool,
    ) -> Result<()> {
        let created = !existed && (options.create || options.create_new);
        let truncated = existed && options.truncate;
        if !created && !truncated {
            return Ok(());
        }

        let metadata = file.metadata().map_err(|e| BackupError::io(path, e))?;
        let id = ObjectId::from_metadata(path, &metadata);
        let destination = session.paths.translate(path)?;

        if created {
            self.shared.pause(PausePoint::OpenDestinationFile);
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent).map_err(|e| BackupError::mirror(Operation::Create, parent, e))?;
            }
            let mut mirror = OpenOptions::new();
            mirror.write(true).create(true).truncate(true);
            #[cfg(unix)]
            if let Some(mode) = options.mode {
                use std::os::unix::fs::OpenOptionsExt;
                mirror.mode(mode);
            }
            mirror
                .open(&destination)
                .map_err(|e| BackupError::mirror(Operation::Create, &destination, e))?;
            session.capture.mark_visited(id, Visitor::Handler(Operation::Create));
            self.mirrored(session, Operation::Create, path, None);
        } else if session.capture.is_visited(&id) {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&destination)
                .map_err(|e| BackupError::mirror(Operation::Truncate, &destination, e))?;
            self.mirrored(session, Operation::Truncate, path, Some("len 0".to_string()));
        }
        Ok(())
    }

    fn mirror_rename(
        &self,
        session: &ActiveSession,
        from: &Path,
        to: &Path,
        replaced: Option<ObjectId>,
        is_dir: bool,
    ) -> Result<()> {
        self.shared.pause(PausePoint::RenameDestination);

        let metadata = match fs::symlink_metadata(to) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(BackupError::io(to, e)),
        };
        let moved = ObjectId::from_metadata(to, &metadata);
        let destination_from = session.paths.translate(from)?;
        let destination_to = session.paths.translate(to)?;

        // the new parent may not have been reached by the copier yet
        if let Some(parent) = destination_to.parent() {
            fs::create_dir_all(parent).map_err(|e| BackupError::mirror(Operation::Rename, parent, e))?;
        }
        if fs::symlink_metadata(&destination_from).is_ok() {
            fs::rename(&destination_from, &destination_to)
                .map_err(|e| BackupError::mirror(Operation::Rename, &destination_from, e))?;
        } else {
            // never copied: materialize the object at its new name
            match copier::copy_object(to, &destination_to, &metadata, None) {
                Ok(kind) => copier::record_copy(session, kind),
                Err(CopyFailure::Vanished) => return Ok(()),
                Err(CopyFailure::Source(e)) => return Err(BackupError::io(to, e)),
                Err(CopyFailure::Destination(e)) => {
                    return Err(BackupError::mirror(Operation::Rename, &destination_to, e))
                }
            }
        }

        if let Some(replaced) = replaced.filter(|r| *r != moved) {
            session.capture.forget(&replaced);
        }
        if is_dir {
            copier::fill_tree(session, to)?;
        }
        if matches!(moved, ObjectId::Path(_)) {
            session.capture.rekey(&ObjectId::Path(from.to_path_buf()), moved.clone());
        }
        session.capture.mark_visited(moved, Visitor::Handler(Operation::Rename));
        self.mirrored(session, Operation::Rename, from, Some(format!("to {}", to.display())));
        Ok(())
    }

    fn mirror_remove(
        &self,
        session: &ActiveSession,
        path: &Path,
        victim: Option<ObjectId>,
        operation: Operation,
    ) -> Result<()> {
        let destination = session.paths.translate(path)?;
        let result = match operation {
            Operation::Rmdir => fs::remove_dir_all(&destination),
            _ => fs::remove_file(&destination),
        };
        match result {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!("{} not yet copied", path.display());
            }
            Err(e) => return Err(BackupError::mirror(operation, &destination, e)),
        }
        if let Some(victim) = victim {
            session.capture.forget(&victim);
        }
        self.mirrored(session, operation, path, None);
        Ok(())
    }

    fn mirror_mkdir(&self, session: &ActiveSession, path: &Path) -> Result<()> {
        let id = ObjectId::probe(path).map_err(|e| BackupError::io(path, e))?;
        let destination = session.paths.translate(path)?;
        fs::create_dir_all(&destination).map_err(|e| BackupError::mirror(Operation::Mkdir, &destination, e))?;
        session.capture.mark_visited(id, Visitor::Handler(Operation::Mkdir));
        self.mirrored(session, Operation::Mkdir, path, None);
        Ok(())
    }

    /// Run a data mutation on an open file and mirror it if the object has
    /// already been copied.
    fn mutate<'d, R>(
        &self,
        id: DescriptorId,
        file: &File,
        operation: Operation,
        real: impl FnOnce(&File) -> io::Result<(R, Mutation<'d>)>,
    ) -> io::Result<R> {
        let Some(mut path) = self.shared.descriptors.path_of(id) else {
            return real(file).map(|(result, _)| result);
        };
        let Some(scope) = self.shared.admit(&[&path]) else {
            return real(file).map(|(result, _)| result);
        };
        let session = scope.session();
        let _namespace = NamespaceGuard::shared(session);

        // a file rename can move the descriptor while we wait for its name
        let names = loop {
            match session.lock_names(&[&path]) {
                Ok(guard) => match self.shared.descriptors.path_of(id) {
                    Some(current) if current == path => break Some(guard),
                    Some(current) if session.paths.is_under_tree(&current) => {
                        drop(guard);
                        path = current;
                    }
                    _ => break None,
                },
                Err(err) => {
                    self.fail(operation, &path, &err);
                    break None;
                }
            }
        };

        let (result, mutation) = real(file)?;

        if names.is_some() {
            if let Err(err) = self.mirror_mutation(session, &path, file, operation, &mutation) {
                self.fail(operation, &path, &err);
            }
        }
        Ok(result)
    }

    fn mirror_mutation(
        &self,
        session: &ActiveSession,
        path: &Path,
        file: &File,
        operation: Operation,
        mutation: &Mutation<'_>,
    ) -> Result<()> {
        let metadata = file.metadata().map_err(|e| BackupError::io(path, e))?;
        let id = ObjectId::from_metadata(path, &metadata);
        if !session.capture.is_visited(&id) {
            trace!("{} not yet copied, leaving {} to the copier", path.display(), operation);
            return Ok(());
        }

        self.shared.pause(PausePoint::MirrorWrite);
        let destination = session.paths.translate(path)?;
        let mirror = match OpenOptions::new().write(true).open(&destination) {
            Ok(mirror) => mirror,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No destination copy of {} to update", path.display());
                return Ok(());
            }
            Err(e) => return Err(BackupError::mirror(operation, &destination, e)),
        };

        let detail = match *mutation {
            Mutation::Write { offset, data } => {
                write_all_at(&mirror, data, offset)
                    .map_err(|e| BackupError::mirror(operation, &destination, e))?;
                format!("{} bytes at {}", data.len(), offset)
            }
            Mutation::Truncate { len } => {
                mirror
                    .set_len(len)
                    .map_err(|e| BackupError::mirror(operation, &destination, e))?;
                format!("len {}", len)
            }
        };
        self.mirrored(session, operation, path, Some(detail));
        Ok(())
    }

    fn mirrored(&self, session: &ActiveSession, operation: Operation, path: &Path, detail: Option<String>) {
        trace!("Mirrored {} of {}", operation, path.display());
        session.stats.mirrored();
        session.journal.record(operation, path, detail);
    }
}

/// A source file opened through an [`Interceptor`].
///
/// Writes go to the real file first and are then mirrored. Dropping the
/// handle is the close.
pub struct CapturedFile {
    id: DescriptorId,
    file: File,
    interceptor: Interceptor,
}

impl CapturedFile {
    pub fn id(&self) -> DescriptorId {
        self.id
    }

    /// The underlying source file. Writes made through it are not mirrored.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Source path this descriptor refers to now; `None` once unlinked.
    pub fn path(&self) -> Option<PathBuf> {
        self.interceptor.shared.descriptors.path_of(self.id)
    }

    /// Positional write that leaves the cursor untouched.
    #[cfg(unix)]
    pub fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        self.interceptor.mutate(self.id, &self.file, Operation::Write, |file| {
            let n = file.write_at(buf, offset)?;
            Ok((n, Mutation::Write { offset, data: &buf[..n] }))
        })
    }

    pub fn set_len(&self, len: u64) -> io::Result<()> {
        self.interceptor.mutate(self.id, &self.file, Operation::Truncate, |file| {
            file.set_len(len)?;
            Ok(((), Mutation::Truncate { len }))
        })
    }

    pub fn sync_all(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    pub fn close(self) {
        drop(self);
    }
}

impl Write for CapturedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.interceptor.mutate(self.id, &self.file, Operation::Write, |file| {
            let mut handle = file;
            let n = handle.write(buf)?;
            let end = handle.stream_position()?;
            Ok((n, Mutation::Write { offset: end - n as u64, data: &buf[..n] }))
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        (&self.file).flush()
    }
}

impl Read for CapturedFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.file).read(buf)
    }
}

impl Seek for CapturedFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        (&self.file).seek(pos)
    }
}

impl Drop for CapturedFile {
    fn drop(&mut self) {
        self.interceptor.shared.descriptors.release(self.id);
    }
}

impl std::fmt::Debug for CapturedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturedFile")
            .field("id", &self.id)
            .field("path", &self.path())
            .finish()
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, data: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(not(unix))]
fn write_all_at(mut file: &File, data: &[u8], offset: u64) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)
}

fn is_directory(path: &Path) -> bool {
    fs::symlink_metadata(path).map(|m| m.is_dir()).unwrap_or(false)
}

/// Absolute, lexically normalized form used for admission and name locks.
fn resolve(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    normalize(&absolute).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupManager;
    use crate::utils::config::Config;

    #[test]
    fn test_resolve_normalizes_dot_segments() {
        let resolved = resolve(Path::new("/a/./b/../c"));
        assert_eq!(resolved, PathBuf::from("/a/c"));
    }

    #[test]
    fn test_idle_interceptor_passes_through() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(Config::with_roots(tmp.path(), tmp.path()));
        let interceptor = manager.interceptor();

        let path = tmp.path().join("plain");
        let mut file = interceptor.create(&path).unwrap();
        file.write_all(b"hello").unwrap();
        interceptor.rename(&path, tmp.path().join("moved")).unwrap();
        assert_eq!(file.path(), Some(tmp.path().join("moved")));
        drop(file);

        assert_eq!(fs::read(tmp.path().join("moved")).unwrap(), b"hello");
        assert_eq!(manager.status().open_descriptors, 0);
    }

    #[test]
    fn test_descriptor_follows_unlink() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(Config::default());
        let interceptor = manager.interceptor();

        let path = tmp.path().join("doomed");
        let mut file = interceptor.create(&path).unwrap();
        interceptor.remove_file(&path).unwrap();
        assert_eq!(file.path(), None);
        // writes to an unlinked file still reach the open inode
        file.write_all(b"orphan").unwrap();
    }

    #[test]
    fn test_source_errors_are_returned_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(Config::default());
        let interceptor = manager.interceptor();

        let err = interceptor.open(tmp.path().join("missing")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        let err = interceptor.remove_dir(tmp.path().join("missing")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
