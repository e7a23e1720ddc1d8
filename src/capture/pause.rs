//! Named rendezvous points for driving race windows deterministically.
//!
//! A point does nothing until it is armed with [`PausePoints::toggle`]. While
//! armed, every thread reaching the matching checkpoint parks; the next
//! toggle disarms it and releases all of them. Managers built for production
//! carry no registry, so a checkpoint there is a single `None` check.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

/// Checkpoints embedded in the handlers and the copier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PausePoint {
    /// Create handler, after the source file exists and before its
    /// destination counterpart is created.
    OpenDestinationFile,
    /// Rename handler, after the source rename and before the destination one.
    RenameDestination,
    /// Write/truncate handler, before the mutation is applied to the destination.
    MirrorWrite,
    /// Copier, before it locks and copies each object.
    CopierBeforeCopy,
    /// Copier, after the walk and before it reports completion.
    CopierAfterWalk,
}

impl PausePoint {
    pub const ALL: [PausePoint; 5] = [
        PausePoint::OpenDestinationFile,
        PausePoint::RenameDestination,
        PausePoint::MirrorWrite,
        PausePoint::CopierBeforeCopy,
        PausePoint::CopierAfterWalk,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PausePoint::OpenDestinationFile => "OPEN_DESTINATION_FILE",
            PausePoint::RenameDestination => "RENAME_DESTINATION",
            PausePoint::MirrorWrite => "MIRROR_WRITE",
            PausePoint::CopierBeforeCopy => "COPIER_BEFORE_COPY",
            PausePoint::CopierAfterWalk => "COPIER_AFTER_WALK",
        }
    }
}

impl fmt::Display for PausePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PausePoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PausePoint::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown pause point: {s}"))
    }
}

#[derive(Debug, Default)]
struct PointState {
    armed: bool,
    waiting: usize,
    // bumped on every disarm; a waiter leaves once it changes
    generation: u64,
}

#[derive(Debug, Default)]
pub struct PausePoints {
    points: Mutex<HashMap<PausePoint, PointState>>,
    changed: Condvar,
}

impl PausePoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip `point` between armed and disarmed; returns the new armed state.
    pub fn toggle(&self, point: PausePoint) -> bool {
        let mut points = self.points.lock();
        let state = points.entry(point).or_default();
        state.armed = !state.armed;
        if !state.armed {
            state.generation += 1;
        }
        let armed = state.armed;
        drop(points);
        self.changed.notify_all();
        tracing::debug!(point = %point, armed, "pause point toggled");
        armed
    }

    pub fn is_armed(&self, point: PausePoint) -> bool {
        self.points.lock().get(&point).map_or(false, |s| s.armed)
    }

    /// Park the calling thread while `point` is armed.
    pub fn checkpoint(&self, point: PausePoint) {
        let mut points = self.points.lock();
        let generation = match points.get_mut(&point) {
            Some(state) if state.armed => {
                state.waiting += 1;
                state.generation
            }
            _ => return,
        };
        drop(points);
        self.changed.notify_all();
        tracing::debug!(point = %point, "parked at pause point");

        let mut points = self.points.lock();
        loop {
            let state = points.entry(point).or_default();
            if state.generation != generation {
                state.waiting -= 1;
                break;
            }
            self.changed.wait(&mut points);
        }
        drop(points);
        self.changed.notify_all();
    }

    /// Threads currently parked at `point`.
    pub fn waiting(&self, point: PausePoint) -> usize {
        self.points.lock().get(&point).map_or(0, |s| s.waiting)
    }

    /// Block until at least `count` threads are parked at `point`.
    pub fn wait_for_waiters(&self, point: PausePoint, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut points = self.points.lock();
        loop {
            if points.get(&point).map_or(0, |s| s.waiting) >= count {
                return true;
            }
            if self.changed.wait_until(&mut points, deadline).timed_out() {
                return points.get(&point).map_or(0, |s| s.waiting) >= count;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const WAIT: Duration = Duration::from_secs(10);

    #[test]
    fn test_names_round_trip_through_from_str() {
        for point in PausePoint::ALL {
            assert_eq!(point.name().parse::<PausePoint>().unwrap(), point);
        }
        assert_eq!(
            "open_destination_file".parse::<PausePoint>().unwrap(),
            PausePoint::OpenDestinationFile
        );
        assert!("NOPE".parse::<PausePoint>().is_err());
    }

    #[test]
    fn test_serde_uses_checkpoint_names() {
        let json = serde_json::to_string(&PausePoint::OpenDestinationFile).unwrap();
        assert_eq!(json, "\"OPEN_DESTINATION_FILE\"");
    }

    #[test]
    fn test_disarmed_checkpoint_does_not_block() {
        let points = PausePoints::new();
        points.checkpoint(PausePoint::MirrorWrite);
        assert!(!points.is_armed(PausePoint::MirrorWrite));
    }

    #[test]
    fn test_toggle_twice_without_waiters_is_a_no_op() {
        let points = PausePoints::new();
        assert!(points.toggle(PausePoint::CopierAfterWalk));
        assert!(!points.toggle(PausePoint::CopierAfterWalk));
        assert!(!points.is_armed(PausePoint::CopierAfterWalk));
        points.checkpoint(PausePoint::CopierAfterWalk);
        assert_eq!(points.waiting(PausePoint::CopierAfterWalk), 0);
    }

    #[test]
    fn test_disarm_releases_parked_thread() {
        let points = Arc::new(PausePoints::new());
        let passed = Arc::new(AtomicUsize::new(0));
        points.toggle(PausePoint::OpenDestinationFile);

        let worker = {
            let points = points.clone();
            let passed = passed.clone();
            std::thread::spawn(move || {
                points.checkpoint(PausePoint::OpenDestinationFile);
                passed.fetch_add(1, Ordering::SeqCst);
            })
        };

        assert!(points.wait_for_waiters(PausePoint::OpenDestinationFile, 1, WAIT));
        assert_eq!(passed.load(Ordering::SeqCst), 0);

        points.toggle(PausePoint::OpenDestinationFile);
        worker.join().unwrap();
        assert_eq!(passed.load(Ordering::SeqCst), 1);
        assert_eq!(points.waiting(PausePoint::OpenDestinationFile), 0);
    }

    #[test]
    fn test_disarm_only_releases_its_own_point() {
        let points = Arc::new(PausePoints::new());
        points.toggle(PausePoint::OpenDestinationFile);
        points.toggle(PausePoint::MirrorWrite);

        let spawn_at = |point: PausePoint| {
            let points = points.clone();
            std::thread::spawn(move || points.checkpoint(point))
        };
        let open = spawn_at(PausePoint::OpenDestinationFile);
        let write = spawn_at(PausePoint::MirrorWrite);

        assert!(points.wait_for_waiters(PausePoint::OpenDestinationFile, 1, WAIT));
        assert!(points.wait_for_waiters(PausePoint::MirrorWrite, 1, WAIT));

        points.toggle(PausePoint::OpenDestinationFile);
        open.join().unwrap();
        assert_eq!(points.waiting(PausePoint::MirrorWrite), 1);
        assert!(!write.is_finished());

        points.toggle(PausePoint::MirrorWrite);
        write.join().unwrap();
    }

    #[test]
    fn test_rearm_after_release_parks_new_arrivals_only() {
        let points = Arc::new(PausePoints::new());
        points.toggle(PausePoint::RenameDestination);
        let first = {
            let points = points.clone();
            std::thread::spawn(move || points.checkpoint(PausePoint::RenameDestination))
        };
        assert!(points.wait_for_waiters(PausePoint::RenameDestination, 1, WAIT));

        // disarm and immediately re-arm: the parked thread still leaves
        points.toggle(PausePoint::RenameDestination);
        points.toggle(PausePoint::RenameDestination);
        first.join().unwrap();

        assert!(!points.wait_for_waiters(PausePoint::RenameDestination, 1, Duration::from_millis(20)));
        points.toggle(PausePoint::RenameDestination);
    }
}
