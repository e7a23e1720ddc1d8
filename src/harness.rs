//! Race scenarios driven against a live backup session.

use crate::backup::{BackupManager, SessionReport};
use crate::capture::pause::{PausePoint, PausePoints};
use crate::utils::config::Config;
use crate::utils::verify::{compare_trees, TreeDiff};
use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::info;

/// Boxed operation for [`run_concurrently`].
pub type Job<'a, T> = Box<dyn FnOnce() -> T + Send + 'a>;

/// Run every job on its own scoped thread and collect results in order.
///
/// Panics in a job are propagated once all jobs have been joined.
pub fn run_concurrently<'a, T: Send + 'a>(jobs: Vec<Job<'a, T>>) -> Vec<T> {
    thread::scope(|scope| {
        let handles: Vec<_> = jobs
            .into_iter()
            .enumerate()
            .map(|(i, job)| {
                thread::Builder::new()
                    .name(format!("hotbackup-race-{i}"))
                    .spawn_scoped(scope, job)
                    .unwrap_or_else(|e| panic!("failed to spawn race thread {i}: {e}"))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|p| std::panic::resume_unwind(p)))
            .collect()
    })
}

/// What the create/rename race left behind.
#[derive(Debug, Serialize)]
pub struct RaceOutcome {
    pub report: SessionReport,
    pub renamed_present: bool,
    pub original_absent: bool,
    pub diff: TreeDiff,
}

impl RaceOutcome {
    pub fn is_consistent(&self) -> bool {
        self.renamed_present && self.original_absent && self.diff.is_clean()
    }
}

/// How long the scenario waits for a thread to reach a pause point.
const PARK_TIMEOUT: Duration = Duration::from_secs(10);

/// Create `A` and rename it to `B` while the create is parked between its
/// source and destination effects, then check that `B` reached the backup.
pub fn create_rename_race(source: &Path, destination: &Path) -> Result<RaceOutcome> {
    let points = Arc::new(PausePoints::new());
    let mut config = Config::with_roots(source, destination);
    config.wait_timeout = "60s".to_string();
    let manager = BackupManager::with_pause_points(config, points.clone());
    let interceptor = manager.interceptor();

    let created = source.join("A");
    let renamed = source.join("B");

    if !points.is_armed(PausePoint::OpenDestinationFile) {
        manager.toggle_pause_point(PausePoint::OpenDestinationFile)?;
    }
    manager.set_keep_capturing(true);
    manager.start().context("failed to start backup session")?;

    let create_job = {
        let interceptor = interceptor.clone();
        let created = created.clone();
        thread::Builder::new()
            .name("hotbackup-create".to_string())
            .spawn(move || interceptor.create(&created).map(drop))?
    };

    if !points.wait_for_waiters(PausePoint::OpenDestinationFile, 1, PARK_TIMEOUT) {
        bail!("create never reached {}", PausePoint::OpenDestinationFile);
    }

    let rename_job = {
        let interceptor = interceptor.clone();
        let (created, renamed) = (created.clone(), renamed.clone());
        thread::Builder::new()
            .name("hotbackup-rename".to_string())
            .spawn(move || interceptor.rename(&created, &renamed))?
    };

    // let the rename queue up behind the parked create
    thread::sleep(Duration::from_millis(50));
    manager.toggle_pause_point(PausePoint::OpenDestinationFile)?;

    create_job
        .join()
        .map_err(|_| anyhow!("create thread panicked"))?
        .with_context(|| format!("create of {} failed", created.display()))?;
    rename_job
        .join()
        .map_err(|_| anyhow!("rename thread panicked"))?
        .with_context(|| format!("rename to {} failed", renamed.display()))?;

    manager.set_keep_capturing(false);
    let report = manager.finish()?;

    let outcome = RaceOutcome {
        renamed_present: destination.join("B").exists(),
        original_absent: !destination.join("A").exists(),
        diff: compare_trees(source, destination)?,
        report,
    };
    info!(
        "Create/rename race finished: B present {}, A absent {}",
        outcome.renamed_present, outcome.original_absent
    );
    Ok(outcome)
}

/// Fresh, empty source and destination directories under `workdir`.
pub fn prepare_race_dirs(workdir: &Path) -> Result<(PathBuf, PathBuf)> {
    let workdir = fs::canonicalize(workdir)
        .with_context(|| format!("failed to resolve {}", workdir.display()))?;
    let run = workdir.join(format!("hotbackup-race-{}", uuid::Uuid::new_v4()));
    let source = run.join("S");
    let destination = run.join("D");
    fs::create_dir_all(&source).with_context(|| format!("failed to create {}", source.display()))?;
    fs::create_dir_all(&destination)
        .with_context(|| format!("failed to create {}", destination.display()))?;
    Ok((source, destination))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_run_concurrently_preserves_order() {
        let results = run_concurrently(vec![
            Box::new(|| 1) as Job<'_, i32>,
            Box::new(|| 2),
            Box::new(|| 3),
        ]);
        assert_eq!(results, vec![1, 2, 3]);
    }

    #[test]
    fn test_run_concurrently_borrows_from_caller() {
        let counter = AtomicUsize::new(0);
        let jobs: Vec<Job<'_, ()>> = (0..8)
            .map(|_| {
                Box::new(|| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }) as Job<'_, ()>
            })
            .collect();
        run_concurrently(jobs);
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_prepare_race_dirs_creates_empty_roots() {
        let tmp = tempfile::tempdir().unwrap();
        let (source, destination) = prepare_race_dirs(tmp.path()).unwrap();
        assert!(source.is_dir());
        assert_eq!(fs::read_dir(&destination).unwrap().count(), 0);
    }
}
