//! Tool system

pub mod framework;
pub mod registry;

pub use framework::{Tool, ToolContext};
pub use registry::ToolRegistry;
