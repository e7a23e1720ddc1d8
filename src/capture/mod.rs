//! Filesystem interception: the handlers host code calls instead of `std::fs`,
//! and the shared structures they and the copier synchronize through.

pub mod descriptors;
pub mod handlers;
pub mod locks;
pub mod paths;
pub mod pause;
pub mod state;

pub use descriptors::DescriptorId;
pub use handlers::{CaptureOptions, CapturedFile, Interceptor};
pub use paths::PathTranslator;
pub use pause::{PausePoint, PausePoints};
pub use state::{ObjectId, Visitor};
