//! Background walk that copies every object the handlers have not already captured.

use super::manager::Shared;
use super::session::ActiveSession;
use super::{Fault, Operation};
use crate::capture::pause::PausePoint;
use crate::capture::state::{ObjectId, Visitor};
use crate::error::{BackupError, Result};
use std::fs::{self, File, Metadata};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace};
use walkdir::WalkDir;

const COPY_BUFFER: usize = 128 * 1024;

// Shorter pauses are not worth a context switch.
const MINIMUM_SLEEP: Duration = Duration::from_millis(10);

pub(crate) fn spawn(shared: Arc<Shared>, session: Arc<ActiveSession>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("hotbackup-copier".to_string())
        .spawn(move || Copier::new(shared, session).run())
}

struct Copier {
    shared: Arc<Shared>,
    session: Arc<ActiveSession>,
    throttle: Throttle,
    objects: u64,
}

impl Copier {
    fn new(shared: Arc<Shared>, session: Arc<ActiveSession>) -> Self {
        let throttle = Throttle::new(session.copy_bytes_per_sec);
        Self {
            shared,
            session,
            throttle,
            objects: 0,
        }
    }

    fn run(mut self) {
        let root = self.session.paths.source_root().to_path_buf();
        let _guard = PanicGuard {
            shared: self.shared.clone(),
            root: root.clone(),
        };
        info!("Copier walking {}", root.display());

        for entry in WalkDir::new(&root).follow_links(false) {
            if self.shared.is_aborted() {
                info!("Copier stopping, session aborted");
                return;
            }
            let path = match entry {
                Ok(entry) => entry.into_path(),
                Err(err) if is_vanished(&err) => {
                    debug!("Skipping vanished entry: {}", err);
                    self.session.stats.vanished();
                    continue;
                }
                Err(err) => {
                    let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                    self.shared.abort(Fault::new(Operation::Copy, path, err.to_string()));
                    return;
                }
            };
            if let Err(err) = self.visit(&path) {
                self.shared.abort(Fault::from_error(Operation::Copy, &path, &err));
                return;
            }
        }

        self.shared.pause(PausePoint::CopierAfterWalk);
        info!("Copier finished walk: {} objects copied", self.objects);
        self.shared.walk_completed(self.objects);
    }

    fn visit(&mut self, source: &Path) -> Result<()> {
        self.shared.pause(PausePoint::CopierBeforeCopy);

        let session = self.session.clone();
        let _namespace = session.namespace_shared();
        let _names = session.lock_names(&[source])?;

        let metadata = match fs::symlink_metadata(source) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!("{} vanished before copy", source.display());
                session.stats.vanished();
                return Ok(());
            }
            Err(e) => return Err(BackupError::io(source, e)),
        };

        let id = ObjectId::from_metadata(source, &metadata);
        if session.capture.is_visited(&id) {
            trace!("{} already captured", source.display());
            return Ok(());
        }

        let destination = session.paths.translate(source)?;
        match copy_object(source, &destination, &metadata, Some(&mut self.throttle)) {
            Ok(kind) => record_copy(&session, kind),
            Err(CopyFailure::Vanished) => {
                session.stats.vanished();
                return Ok(());
            }
            Err(CopyFailure::Source(e)) => return Err(BackupError::io(source, e)),
            Err(CopyFailure::Destination(e)) => {
                return Err(BackupError::mirror(Operation::Copy, destination, e))
            }
        }

        session.capture.mark_visited(id, Visitor::Copier);
        self.objects += 1;
        Ok(())
    }
}

/// Turns a copier panic into a session fault so `finish` does not wait forever.
struct PanicGuard {
    shared: Arc<Shared>,
    root: PathBuf,
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("Copier thread panicked");
            self.shared.abort(Fault::new(
                Operation::Copy,
                self.root.clone(),
                BackupError::CopierPanicked.to_string(),
            ));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CopiedKind {
    Directory,
    File(u64),
    Symlink,
    /// Sockets, fifos and devices are not copied.
    Skipped,
}

#[derive(Debug)]
pub(crate) enum CopyFailure {
    Vanished,
    Source(io::Error),
    Destination(io::Error),
}

/// Copy one source object to its destination path. Directories are created
/// without their contents; parents must already exist for files and links.
pub(crate) fn copy_object(
    source: &Path,
    destination: &Path,
    metadata: &Metadata,
    throttle: Option<&mut Throttle>,
) -> std::result::Result<CopiedKind, CopyFailure> {
    let file_type = metadata.file_type();
    if file_type.is_dir() {
        fs::create_dir_all(destination).map_err(CopyFailure::Destination)?;
        Ok(CopiedKind::Directory)
    } else if file_type.is_symlink() {
        copy_symlink(source, destination)
    } else if file_type.is_file() {
        let kind = copy_file(source, destination, throttle)?;
        fs::set_permissions(destination, metadata.permissions()).map_err(CopyFailure::Destination)?;
        Ok(kind)
    } else {
        debug!("Skipping special file {}", source.display());
        Ok(CopiedKind::Skipped)
    }
}

fn copy_file(
    source: &Path,
    destination: &Path,
    mut throttle: Option<&mut Throttle>,
) -> std::result::Result<CopiedKind, CopyFailure> {
    let mut reader = File::open(source).map_err(source_failure)?;
    let mut writer = File::create(destination).map_err(CopyFailure::Destination)?;

    let mut buffer = vec![0u8; COPY_BUFFER];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CopyFailure::Source(e)),
        };
        writer.write_all(&buffer[..n]).map_err(CopyFailure::Destination)?;
        total += n as u64;
        if let Some(throttle) = throttle.as_mut() {
            throttle.consumed(n as u64);
        }
    }
    Ok(CopiedKind::File(total))
}

#[cfg(unix)]
fn copy_symlink(source: &Path, destination: &Path) -> std::result::Result<CopiedKind, CopyFailure> {
    let target = fs::read_link(source).map_err(source_failure)?;
    if fs::symlink_metadata(destination).is_ok() {
        fs::remove_file(destination).map_err(CopyFailure::Destination)?;
    }
    std::os::unix::fs::symlink(&target, destination).map_err(CopyFailure::Destination)?;
    Ok(CopiedKind::Symlink)
}

#[cfg(not(unix))]
fn copy_symlink(source: &Path, _destination: &Path) -> std::result::Result<CopiedKind, CopyFailure> {
    debug!("Skipping symlink {}", source.display());
    Ok(CopiedKind::Skipped)
}

fn source_failure(e: io::Error) -> CopyFailure {
    if e.kind() == io::ErrorKind::NotFound {
        CopyFailure::Vanished
    } else {
        CopyFailure::Source(e)
    }
}

fn is_vanished(err: &walkdir::Error) -> bool {
    err.io_error()
        .map_or(false, |e| e.kind() == io::ErrorKind::NotFound)
}

pub(crate) fn record_copy(session: &ActiveSession, kind: CopiedKind) {
    match kind {
        CopiedKind::Directory => session.stats.dir_copied(),
        CopiedKind::File(bytes) => session.stats.file_copied(bytes),
        CopiedKind::Symlink => session.stats.symlink_copied(),
        CopiedKind::Skipped => {}
    }
}

/// Copy every not-yet-visited object below `source_dir` on behalf of a
/// directory rename. Caller holds the namespace exclusively.
pub(crate) fn fill_tree(session: &ActiveSession, source_dir: &Path) -> Result<()> {
    for entry in WalkDir::new(source_dir).follow_links(false).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if is_vanished(&err) => continue,
            Err(err) => {
                let path = err.path().unwrap_or(source_dir).to_path_buf();
                return Err(BackupError::io(path, err.into()));
            }
        };
        let path = entry.path();
        let metadata = match fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(BackupError::io(path, e)),
        };
        let id = ObjectId::from_metadata(path, &metadata);
        if session.capture.is_visited(&id) {
            continue;
        }

        let destination = session.paths.translate(path)?;
        match copy_object(path, &destination, &metadata, None) {
            Ok(kind) => record_copy(session, kind),
            Err(CopyFailure::Vanished) => continue,
            Err(CopyFailure::Source(e)) => return Err(BackupError::io(path, e)),
            Err(CopyFailure::Destination(e)) => {
                return Err(BackupError::mirror(Operation::Rename, destination, e))
            }
        }
        session.capture.mark_visited(id, Visitor::Handler(Operation::Rename));
    }
    Ok(())
}

/// Paces copier reads to a byte rate. A rate of zero disables pacing.
pub(crate) struct Throttle {
    bytes_per_sec: u64,
    started: Instant,
    bytes: u64,
}

impl Throttle {
    pub(crate) fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec,
            started: Instant::now(),
            bytes: 0,
        }
    }

    pub(crate) fn consumed(&mut self, bytes: u64) {
        if self.bytes_per_sec == 0 {
            return;
        }
        self.bytes += bytes;
        let expected = Duration::from_secs_f64(self.bytes as f64 / self.bytes_per_sec as f64);
        let elapsed = self.started.elapsed();
        if let Some(ahead) = expected.checked_sub(elapsed) {
            if ahead >= MINIMUM_SLEEP {
                thread::sleep(ahead);
            }
        }
    }
}
