#![allow(dead_code)]

use crossbeam_channel::Receiver;
use hotbackup::{BackupManager, Config, Event, PausePoint, PausePoints};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const PARK_TIMEOUT: Duration = Duration::from_secs(10);

/// Empty source `S` and destination `D` under a canonical scratch directory.
pub struct Fixture {
    _tmp: TempDir,
    pub root: PathBuf,
    pub source: PathBuf,
    pub destination: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(tmp.path()).unwrap();
        let source = root.join("S");
        let destination = root.join("D");
        fs::create_dir(&source).unwrap();
        fs::create_dir(&destination).unwrap();
        Self {
            _tmp: tmp,
            root,
            source,
            destination,
        }
    }

    pub fn src(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.source.join(relative)
    }

    pub fn dst(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.destination.join(relative)
    }

    pub fn config(&self) -> Config {
        let mut config = Config::with_roots(&self.source, &self.destination);
        config.wait_timeout = "20s".to_string();
        config
    }

    pub fn manager(&self) -> BackupManager {
        BackupManager::new(self.config())
    }

    pub fn paused_manager(&self) -> (BackupManager, Arc<PausePoints>) {
        let points = Arc::new(PausePoints::new());
        (BackupManager::with_pause_points(self.config(), points.clone()), points)
    }

    /// Write a file below the source root, creating parents.
    pub fn seed(&self, relative: &str, contents: &[u8]) -> PathBuf {
        let path = self.src(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        path
    }
}

/// Block until the copier reports its walk finished.
pub fn wait_for_walk(events: &Receiver<Event>) {
    loop {
        match events.recv_timeout(Duration::from_secs(30)) {
            Ok(Event::WalkCompleted { .. }) => return,
            Ok(_) => continue,
            Err(e) => panic!("no WalkCompleted event: {e}"),
        }
    }
}

/// Arm a pause point that is currently disarmed.
pub fn arm(manager: &BackupManager, point: PausePoint) {
    assert!(manager.toggle_pause_point(point).unwrap(), "{point} was already armed");
}

pub fn disarm(manager: &BackupManager, point: PausePoint) {
    assert!(!manager.toggle_pause_point(point).unwrap(), "{point} was not armed");
}

/// Start a session held open by `keep_capturing` and wait for the walk.
pub fn start_and_walk(manager: &BackupManager) {
    let events = manager.subscribe_events();
    manager.set_keep_capturing(true);
    manager.start().unwrap();
    wait_for_walk(&events);
}
