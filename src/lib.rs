//! Hot backup of a live directory tree.
//!
//! A [`BackupManager`] copies a source tree into an empty destination on a
//! background thread while host code keeps mutating the source through an
//! [`Interceptor`]. Mutations of objects the copier has already visited are
//! mirrored into the destination, so the finished copy matches the source as
//! of the moment capturing stops.

pub mod backup;
pub mod capture;
pub mod error;
pub mod harness;
pub mod utils;

pub use backup::{BackupManager, BackupState, BackupStatus, Event, Fault, Operation, SessionReport};
pub use capture::{CaptureOptions, CapturedFile, Interceptor, PausePoint, PausePoints};
pub use error::{BackupError, Result};
pub use utils::config::Config;
