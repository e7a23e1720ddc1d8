pub mod config;
pub mod journal;
pub mod logging;
pub mod verify;

pub use config::{load_config, Config};
pub use journal::{Journal, JournalEntry};
pub use verify::{compare_trees, TreeDiff};
