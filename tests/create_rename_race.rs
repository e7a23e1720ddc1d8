mod common;

use common::{arm, disarm, Fixture, PARK_TIMEOUT};
use hotbackup::harness::{self, run_concurrently, Job};
use hotbackup::utils::compare_trees;
use hotbackup::PausePoint;
use std::io::{self, Write};
use std::thread;
use std::time::Duration;

#[test]
fn test_harness_scenario_keeps_renamed_file() {
    let tmp = tempfile::tempdir().unwrap();
    let (source, destination) = harness::prepare_race_dirs(tmp.path()).unwrap();

    let outcome = harness::create_rename_race(&source, &destination).unwrap();

    assert!(outcome.renamed_present, "D/B missing after race");
    assert!(outcome.original_absent, "D/A left behind");
    assert!(outcome.diff.is_clean(), "trees differ: {:?}", outcome.diff);
    assert!(outcome.is_consistent());
}

#[test]
fn test_rename_waits_for_parked_create() {
    let fx = Fixture::new();
    let (manager, points) = fx.paused_manager();
    let interceptor = manager.interceptor();

    arm(&manager, PausePoint::OpenDestinationFile);
    manager.set_keep_capturing(true);
    manager.start().unwrap();

    let create = {
        let interceptor = interceptor.clone();
        let path = fx.src("A");
        thread::spawn(move || interceptor.create(&path).map(drop))
    };
    assert!(points.wait_for_waiters(PausePoint::OpenDestinationFile, 1, PARK_TIMEOUT));
    // the source effect is already visible, the destination one is not
    assert!(fx.src("A").exists());
    assert!(!fx.dst("A").exists());

    let rename = {
        let interceptor = interceptor.clone();
        let (from, to) = (fx.src("A"), fx.src("B"));
        thread::spawn(move || interceptor.rename(&from, &to))
    };
    thread::sleep(Duration::from_millis(100));
    assert!(!rename.is_finished(), "rename overtook the parked create");
    assert!(!fx.src("B").exists());

    disarm(&manager, PausePoint::OpenDestinationFile);
    create.join().unwrap().unwrap();
    rename.join().unwrap().unwrap();

    manager.set_keep_capturing(false);
    manager.finish().unwrap();

    assert!(fx.dst("B").is_file());
    assert!(!fx.dst("A").exists());
}

#[test]
fn test_concurrent_create_and_rename_never_lose_data() {
    for round in 0..20 {
        let fx = Fixture::new();
        fx.seed("existing/one", b"one");
        fx.seed("existing/two", b"two");
        let manager = fx.manager();
        let interceptor = manager.interceptor();

        manager.set_keep_capturing(true);
        manager.start().unwrap();

        let (from, to) = (fx.src("A"), fx.src("B"));
        let jobs: Vec<Job<'_, io::Result<()>>> = vec![
            Box::new(|| {
                let mut file = interceptor.create(&from)?;
                file.write_all(format!("round {round}").as_bytes())
            }),
            Box::new(|| match interceptor.rename(&from, &to) {
                // lost the race to the create; nothing to rename yet
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                other => other,
            }),
        ];
        for result in run_concurrently(jobs) {
            result.unwrap();
        }

        manager.set_keep_capturing(false);
        manager.finish().unwrap();

        let diff = compare_trees(&fx.source, &fx.destination).unwrap();
        assert!(diff.is_clean(), "round {round}: {diff:?}");
        assert_ne!(fx.src("A").exists(), fx.src("B").exists());
    }
}
