//! Service layer
//!
//! Configuration consumed by the agentic layer.

pub mod config;

pub use config::{AgentConfig, CompactionConfig, CoreConfig, ExperimentalConfig};
