//! Error types for the backup engine.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::backup::{BackupState, Fault, Operation};

pub type Result<T, E = BackupError> = std::result::Result<T, E>;

/// Errors surfaced by the session control surface and recorded by handlers.
#[derive(Debug, Error)]
pub enum BackupError {
    /// `start` was called while a session is active.
    #[error("a backup session is already active (state: {state})")]
    SessionConflict { state: BackupState },

    /// `finish` was called with no active session.
    #[error("no backup session is running")]
    NotRunning,

    /// The path does not live under the session's source root.
    #[error("{} is outside the backed-up tree", path.display())]
    OutsideTree { path: PathBuf },

    /// Source or destination root failed validation.
    #[error("invalid backup roots: {reason}")]
    InvalidRoots { reason: String },

    /// A configuration value could not be interpreted.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// A destination-side mirror operation failed.
    #[error("mirroring {operation} of {} failed: {source}", path.display())]
    MirrorFailure {
        operation: Operation,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A handler waited too long for a name held by another operation.
    #[error("waited {waited:?} for {} to be released", path.display())]
    DeadlockTimeout { path: PathBuf, waited: Duration },

    /// The session hit a fatal error; reported once by `finish`.
    #[error("backup aborted: {fault}")]
    BackupAborted { fault: Fault },

    /// Pause points were toggled on a manager built without a registry.
    #[error("pause points are not enabled for this manager")]
    PausePointsDisabled,

    #[error("copier thread panicked")]
    CopierPanicked,

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl BackupError {
    pub(crate) fn mirror(operation: Operation, path: impl Into<PathBuf>, source: io::Error) -> Self {
        BackupError::MirrorFailure {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        BackupError::Io {
            path: path.into(),
            source,
        }
    }

    /// Path the error refers to, if any.
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            BackupError::OutsideTree { path }
            | BackupError::MirrorFailure { path, .. }
            | BackupError::DeadlockTimeout { path, .. }
            | BackupError::Io { path, .. } => Some(path),
            BackupError::BackupAborted { fault } => Some(&fault.path),
            _ => None,
        }
    }
}
