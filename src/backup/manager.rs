use super::copier;
use super::session::{ActiveSession, SessionReport, StatsSnapshot};
use super::{BackupState, Fault, Operation};
use crate::capture::descriptors::DescriptorTable;
use crate::capture::handlers::Interceptor;
use crate::capture::paths::PathTranslator;
use crate::capture::pause::{PausePoint, PausePoints};
use crate::error::{BackupError, Result};
use crate::utils::config::Config;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Owns the backup session lifecycle.
///
/// Cloning is cheap; every clone drives the same manager. Handlers obtained
/// from [`BackupManager::interceptor`] synchronize against it.
#[derive(Clone)]
pub struct BackupManager {
    shared: Arc<Shared>,
}

#[derive(Debug, Clone, Serialize)]
pub enum Event {
    StateChanged(BackupState),
    WalkCompleted { objects: u64 },
    Aborted(Fault),
}

/// State reachable from the manager, the copier thread and every handler.
pub(crate) struct Shared {
    pub(crate) config: Arc<Config>,
    pub(crate) pause: Option<Arc<PausePoints>>,
    pub(crate) descriptors: DescriptorTable,
    // fast paths mirrored from `Control`
    admitting: AtomicBool,
    aborted: AtomicBool,
    control: Mutex<Control>,
    changed: Condvar,
    subscribers: Mutex<Vec<Sender<Event>>>,
}

struct Control {
    state: BackupState,
    keep_capturing: bool,
    capturing: bool,
    admitting: bool,
    session: Option<Arc<ActiveSession>>,
    copier: Option<JoinHandle<()>>,
    walk_done: bool,
    inflight: usize,
    fault: Option<Fault>,
    finishing: bool,
}

/// An admitted handler invocation; counts as in flight until dropped.
pub(crate) struct HandlerScope<'a> {
    shared: &'a Shared,
    session: Arc<ActiveSession>,
}

impl HandlerScope<'_> {
    pub(crate) fn session(&self) -> &ActiveSession {
        &self.session
    }
}

impl Drop for HandlerScope<'_> {
    fn drop(&mut self) {
        self.shared.leave();
    }
}

impl Shared {
    /// Route a handler through capture, or return `None` for passthrough.
    pub(crate) fn admit(&self, paths: &[&Path]) -> Option<HandlerScope<'_>> {
        if !self.admitting.load(Ordering::Acquire) {
            return None;
        }
        let mut control = self.control.lock();
        if !control.admitting {
            return None;
        }
        let session = control.session.as_ref()?;
        if !paths.iter().all(|p| session.paths.is_under_tree(p)) {
            return None;
        }
        let session = session.clone();
        control.inflight += 1;
        Some(HandlerScope { shared: self, session })
    }

    fn leave(&self) {
        let mut control = self.control.lock();
        control.inflight -= 1;
        if control.inflight == 0 {
            self.changed.notify_all();
        }
    }

    pub(crate) fn pause(&self, point: PausePoint) {
        if let Some(points) = &self.pause {
            points.checkpoint(point);
        }
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Record a fatal error. Only the first fault of a session is kept.
    pub(crate) fn abort(&self, fault: Fault) {
        let mut control = self.control.lock();
        if control.fault.is_some() || !control.state.is_active() {
            debug!("ignoring fault after abort: {}", fault);
            return;
        }
        error!("Backup aborted: {}", fault);
        control.fault = Some(fault.clone());
        control.admitting = false;
        self.admitting.store(false, Ordering::Release);
        self.aborted.store(true, Ordering::Release);
        self.transition(&mut control, BackupState::Aborted);
        self.emit(Event::Aborted(fault));
        self.changed.notify_all();
    }

    pub(crate) fn walk_completed(&self, objects: u64) {
        let mut control = self.control.lock();
        control.walk_done = true;
        if control.state == BackupState::Capturing && !control.keep_capturing {
            self.transition(&mut control, BackupState::Draining);
        }
        self.emit(Event::WalkCompleted { objects });
        self.changed.notify_all();
    }

    fn transition(&self, control: &mut Control, state: BackupState) {
        if control.state != state {
            debug!("Backup state {} -> {}", control.state, state);
            control.state = state;
            self.emit(Event::StateChanged(state));
        }
    }

    fn emit(&self, event: Event) {
        self.subscribers.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl BackupManager {
    pub fn new(config: Config) -> Self {
        Self::build(config, None)
    }

    /// Manager whose handlers and copier honour the given pause points.
    pub fn with_pause_points(config: Config, points: Arc<PausePoints>) -> Self {
        Self::build(config, Some(points))
    }

    fn build(config: Config, pause: Option<Arc<PausePoints>>) -> Self {
        let shared = Shared {
            config: Arc::new(config),
            pause,
            descriptors: DescriptorTable::new(),
            admitting: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            control: Mutex::new(Control {
                state: BackupState::Idle,
                keep_capturing: false,
                capturing: false,
                admitting: false,
                session: None,
                copier: None,
                walk_done: false,
                inflight: 0,
                fault: None,
                finishing: false,
            }),
            changed: Condvar::new(),
            subscribers: Mutex::new(Vec::new()),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Handler façade bound to this manager.
    pub fn interceptor(&self) -> Interceptor {
        Interceptor::new(self.shared.clone())
    }

    pub fn pause_points(&self) -> Option<&Arc<PausePoints>> {
        self.shared.pause.as_ref()
    }

    /// Flip a pause point; returns whether it is now armed.
    pub fn toggle_pause_point(&self, point: PausePoint) -> Result<bool> {
        let points = self.shared.pause.as_ref().ok_or(BackupError::PausePointsDisabled)?;
        Ok(points.toggle(point))
    }

    /// Begin a session: validate roots, turn capturing on, spawn the copier.
    pub fn start(&self) -> Result<Uuid> {
        let config = self.shared.config.clone();
        let wait_timeout = config.wait_timeout().map_err(|e| BackupError::InvalidConfig {
            reason: format!("{e:#}"),
        })?;

        {
            let mut control = self.shared.control.lock();
            if !matches!(control.state, BackupState::Idle | BackupState::Finished) {
                return Err(BackupError::SessionConflict { state: control.state });
            }
            self.shared.transition(&mut control, BackupState::Starting);
        }

        let paths = match validate_roots(&config.source_dir, &config.backup_dest) {
            Ok(paths) => paths,
            Err(e) => {
                warn!("Refusing to start backup: {}", e);
                let mut control = self.shared.control.lock();
                self.shared.transition(&mut control, BackupState::Idle);
                self.shared.changed.notify_all();
                return Err(e);
            }
        };

        let session = Arc::new(ActiveSession::new(
            paths,
            wait_timeout,
            config.copy_bytes_per_sec,
            config.journal_entries,
        ));
        let id = session.id();

        let mut control = self.shared.control.lock();
        control.session = Some(session.clone());
        control.walk_done = false;
        control.fault = None;
        control.finishing = false;
        control.capturing = true;
        control.admitting = true;
        self.shared.aborted.store(false, Ordering::Release);
        self.shared.admitting.store(true, Ordering::Release);

        // spawned under the lock so `finish` always finds the handle
        match copier::spawn(self.shared.clone(), session.clone()) {
            Ok(handle) => control.copier = Some(handle),
            Err(e) => {
                error!("Failed to spawn copier thread: {}", e);
                control.session = None;
                control.capturing = false;
                control.admitting = false;
                self.shared.admitting.store(false, Ordering::Release);
                self.shared.transition(&mut control, BackupState::Idle);
                self.shared.changed.notify_all();
                return Err(BackupError::io(session.paths.source_root(), e));
            }
        }

        self.shared.transition(&mut control, BackupState::Capturing);
        self.shared.changed.notify_all();
        info!(
            "Backup session {} started: {} -> {}",
            id,
            session.paths.source_root().display(),
            session.paths.destination_root().display()
        );
        Ok(id)
    }

    /// Hold the session in `Capturing` after the walk while `keep` is true.
    pub fn set_keep_capturing(&self, keep: bool) {
        let mut control = self.shared.control.lock();
        control.keep_capturing = keep;
        if !keep && control.walk_done && control.state == BackupState::Capturing {
            self.shared.transition(&mut control, BackupState::Draining);
        }
        self.shared.changed.notify_all();
        info!("Keep capturing: {}", keep);
    }

    pub fn keep_capturing(&self) -> bool {
        self.shared.control.lock().keep_capturing
    }

    pub fn is_capturing(&self) -> bool {
        self.shared.control.lock().capturing
    }

    pub fn state(&self) -> BackupState {
        self.shared.control.lock().state
    }

    /// Wait for the walk and `keep_capturing`, drain in-flight handlers,
    /// turn capturing off and release the session.
    pub fn finish(&self) -> Result<SessionReport> {
        let mut control = self.shared.control.lock();
        loop {
            match control.state {
                BackupState::Idle | BackupState::Finished => return Err(BackupError::NotRunning),
                BackupState::Starting => self.shared.changed.wait(&mut control),
                _ => break,
            }
        }
        if control.finishing {
            return Err(BackupError::NotRunning);
        }
        control.finishing = true;

        while control.fault.is_none() && !(control.walk_done && !control.keep_capturing) {
            self.shared.changed.wait(&mut control);
        }
        let copier = control.copier.take();
        drop(control);

        if let Some(handle) = copier {
            if handle.join().is_err() {
                let root = self.shared.config.source_dir.clone();
                self.shared
                    .abort(Fault::new(Operation::Copy, root, BackupError::CopierPanicked.to_string()));
            }
        }

        let mut control = self.shared.control.lock();
        control.admitting = false;
        self.shared.admitting.store(false, Ordering::Release);
        if control.state == BackupState::Capturing {
            self.shared.transition(&mut control, BackupState::Draining);
        }
        while control.inflight > 0 {
            debug!("Waiting for {} in-flight handlers", control.inflight);
            self.shared.changed.wait(&mut control);
        }
        control.capturing = false;
        let session = control.session.take();
        let fault = control.fault.take();
        control.walk_done = false;
        control.finishing = false;
        self.shared.transition(&mut control, BackupState::Finished);
        self.shared.changed.notify_all();
        drop(control);

        let session = session.ok_or(BackupError::NotRunning)?;
        let report = session.report();
        session.capture.clear();

        match fault {
            Some(fault) => {
                warn!("Backup session {} aborted: {}", report.session_id, fault);
                Err(BackupError::BackupAborted { fault })
            }
            None => {
                info!(
                    "Backup session {} finished: {} files, {} bytes, {} mirrored operations",
                    report.session_id,
                    report.stats.files_copied,
                    report.stats.bytes_copied,
                    report.stats.mirrored_ops
                );
                Ok(report)
            }
        }
    }

    pub fn status(&self) -> BackupStatus {
        let control = self.shared.control.lock();
        let session = control.session.as_ref();
        BackupStatus {
            state: control.state,
            keep_capturing: control.keep_capturing,
            capturing: control.capturing,
            walk_complete: control.walk_done,
            inflight: control.inflight,
            session_id: session.map(|s| s.id()),
            stats: session.map(|s| s.stats.snapshot()),
            visited_objects: session.map_or(0, |s| s.capture.len()),
            capture_lookups: session.map_or(0, |s| s.capture.lookups()),
            open_descriptors: self.shared.descriptors.len(),
            fault: control.fault.clone(),
        }
    }

    pub fn subscribe_events(&self) -> Receiver<Event> {
        let (tx, rx) = unbounded();
        self.shared.subscribers.lock().push(tx);
        rx
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupStatus {
    pub state: BackupState,
    pub keep_capturing: bool,
    pub capturing: bool,
    pub walk_complete: bool,
    pub inflight: usize,
    pub session_id: Option<Uuid>,
    pub stats: Option<StatsSnapshot>,
    pub visited_objects: usize,
    pub capture_lookups: u64,
    pub open_descriptors: usize,
    pub fault: Option<Fault>,
}

fn validate_roots(source: &Path, destination: &Path) -> Result<PathTranslator> {
    let source = canonical_dir(source, "source")?;
    let destination = canonical_dir(destination, "destination")?;

    if source == destination {
        return Err(BackupError::InvalidRoots {
            reason: format!("source and destination are both {}", source.display()),
        });
    }
    if destination.starts_with(&source) {
        return Err(BackupError::InvalidRoots {
            reason: format!("destination {} lies inside the source tree", destination.display()),
        });
    }
    if source.starts_with(&destination) {
        return Err(BackupError::InvalidRoots {
            reason: format!("source {} lies inside the destination tree", source.display()),
        });
    }

    let mut entries = fs::read_dir(&destination).map_err(|e| BackupError::io(&destination, e))?;
    if entries.next().is_some() {
        return Err(BackupError::InvalidRoots {
            reason: format!("destination {} is not empty", destination.display()),
        });
    }

    Ok(PathTranslator::new(source, destination))
}

fn canonical_dir(path: &Path, role: &str) -> Result<PathBuf> {
    let canonical = fs::canonicalize(path).map_err(|e| BackupError::InvalidRoots {
        reason: format!("{} {}: {}", role, path.display(), e),
    })?;
    if !canonical.is_dir() {
        return Err(BackupError::InvalidRoots {
            reason: format!("{} {} is not a directory", role, canonical.display()),
        });
    }
    Ok(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roots() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("source");
        let destination = tmp.path().join("destination");
        fs::create_dir(&source).unwrap();
        fs::create_dir(&destination).unwrap();
        (tmp, source, destination)
    }

    #[test]
    fn test_validate_accepts_sibling_roots() {
        let (_tmp, source, destination) = roots();
        let paths = validate_roots(&source, &destination).unwrap();
        assert_eq!(paths.source_root(), fs::canonicalize(&source).unwrap());
    }

    #[test]
    fn test_validate_rejects_missing_and_nested_roots() {
        let (tmp, source, destination) = roots();
        assert!(validate_roots(&tmp.path().join("nope"), &destination).is_err());
        assert!(validate_roots(&source, &source).is_err());

        let nested = source.join("inner");
        fs::create_dir(&nested).unwrap();
        assert!(validate_roots(&source, &nested).is_err());
        assert!(validate_roots(&nested, &source).is_err());
    }

    #[test]
    fn test_validate_rejects_non_empty_destination() {
        let (_tmp, source, destination) = roots();
        fs::write(destination.join("stale"), b"x").unwrap();
        let err = validate_roots(&source, &destination).unwrap_err();
        assert!(err.to_string().contains("not empty"));
    }

    #[test]
    fn test_validate_rejects_file_root() {
        let (tmp, _source, destination) = roots();
        let file = tmp.path().join("file");
        fs::write(&file, b"x").unwrap();
        assert!(matches!(
            validate_roots(&file, &destination),
            Err(BackupError::InvalidRoots { .. })
        ));
    }

    #[test]
    fn test_toggle_without_registry_is_rejected() {
        let manager = BackupManager::new(Config::default());
        assert!(matches!(
            manager.toggle_pause_point(PausePoint::MirrorWrite),
            Err(BackupError::PausePointsDisabled)
        ));
    }

    #[test]
    fn test_admission_is_closed_while_idle() {
        let manager = BackupManager::new(Config::default());
        assert!(manager.shared.admit(&[Path::new("/anything")]).is_none());
        assert_eq!(manager.state(), BackupState::Idle);
        assert!(!manager.is_capturing());
    }
}
