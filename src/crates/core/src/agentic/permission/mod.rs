//! Human approval of risky tool invocations

pub mod gate;
pub mod types;

pub use gate::PermissionGate;
pub use types::{AskInput, PermissionDecision, PermissionRequest, PermissionResponse, PermissionTime};
