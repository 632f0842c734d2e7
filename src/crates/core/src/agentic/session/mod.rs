//! Session Management Layer
//!
//! Session persistence, live status, usage accounting, compaction and turn
//! summaries.

pub mod compaction;
pub mod session_manager;
pub mod status;
pub mod summary;
pub mod usage;

pub use compaction::{is_overflow, prune};
pub use session_manager::*;
pub use status::SessionStatusRegistry;
pub use usage::{step_usage, StepUsage};
