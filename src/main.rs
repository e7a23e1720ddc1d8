use anyhow::{bail, Context, Result};
use hotbackup::harness;
use hotbackup::utils::{compare_trees, config::load_config, logging};
use hotbackup::BackupManager;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

fn main() -> ExitCode {
    // .env is optional
    let _ = dotenvy::dotenv();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("hotbackup: {e:#}");
            return ExitCode::from(2);
        }
    };
    logging::init_tracing(config.log_json);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let result = match args.first().map(String::as_str) {
        None | Some("backup") => run_backup(config),
        Some("race") => run_race(args.get(1).map(PathBuf::from)),
        Some(other) => Err(anyhow::anyhow!("unknown command {other:?}, expected `backup` or `race [workdir]`")),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(2)
        }
    }
}

/// Back up the configured tree; `Ok(false)` when verification finds differences.
fn run_backup(config: hotbackup::Config) -> Result<bool> {
    info!("Starting hotbackup v{}", env!("CARGO_PKG_VERSION"));
    let verify = config.verify;
    let manager = BackupManager::new(config);

    manager.start().context("failed to start backup")?;
    let report = manager.finish().context("backup did not complete")?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !verify {
        return Ok(true);
    }
    let diff = compare_trees(&report.source_root, &report.destination_root)?;
    if diff.is_clean() {
        info!("Destination matches source");
        Ok(true)
    } else {
        // the source may have changed after capturing stopped
        warn!(
            "Destination differs from source: {} missing, {} extra, {} mismatched",
            diff.missing.len(),
            diff.extra.len(),
            diff.mismatched.len()
        );
        println!("{}", serde_json::to_string_pretty(&diff)?);
        Ok(false)
    }
}

fn run_race(workdir: Option<PathBuf>) -> Result<bool> {
    let workdir = workdir.unwrap_or_else(std::env::temp_dir);
    if !workdir.is_dir() {
        bail!("race workdir {} is not a directory", workdir.display());
    }
    let (source, destination) = harness::prepare_race_dirs(&workdir)?;
    info!("Running create/rename race in {}", workdir.display());

    let outcome = harness::create_rename_race(&source, &destination)?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(outcome.is_consistent())
}
