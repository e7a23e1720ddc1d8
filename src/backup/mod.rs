pub mod copier;
pub mod manager;
pub mod session;

pub use manager::{BackupManager, BackupStatus, Event};
pub use session::{SessionReport, StatsSnapshot};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Lifecycle of the backup manager's current session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackupState {
    Idle,
    Starting,
    Capturing,
    Draining,
    Aborted,
    Finished,
}

impl BackupState {
    /// Whether a session object exists in this state.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            BackupState::Starting | BackupState::Capturing | BackupState::Draining | BackupState::Aborted
        )
    }
}

impl fmt::Display for BackupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackupState::Idle => "idle",
            BackupState::Starting => "starting",
            BackupState::Capturing => "capturing",
            BackupState::Draining => "draining",
            BackupState::Aborted => "aborted",
            BackupState::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// Filesystem operation kinds seen by the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Open,
    Create,
    Rename,
    Unlink,
    Mkdir,
    Rmdir,
    Write,
    Truncate,
    Copy,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Open => "open",
            Operation::Create => "create",
            Operation::Rename => "rename",
            Operation::Unlink => "unlink",
            Operation::Mkdir => "mkdir",
            Operation::Rmdir => "rmdir",
            Operation::Write => "write",
            Operation::Truncate => "truncate",
            Operation::Copy => "copy",
        };
        f.write_str(name)
    }
}

/// The first fatal error of a session, reported by `finish`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fault {
    pub operation: Operation,
    pub path: PathBuf,
    pub message: String,
    pub timestamp: i64,
}

impl Fault {
    pub fn new(operation: Operation, path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            operation,
            path: path.into(),
            message: message.into(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub(crate) fn from_error(operation: Operation, fallback: &std::path::Path, err: &crate::BackupError) -> Self {
        let path = err.path().unwrap_or(fallback).to_path_buf();
        Self::new(operation, path, err.to_string())
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {}: {}", self.operation, self.path.display(), self.message)
    }
}
