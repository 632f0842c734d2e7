// Steward Core Library - coding-agent execution core
// Four-layer architecture: Util -> Infrastructure -> Service -> Agentic

pub mod agentic; // Agentic service layer - turn loop, stream processing, tools, permissions
pub mod infrastructure; // Infrastructure layer - storage, provider contract, snapshots, logging
pub mod service; // Service layer - configuration
pub mod util; // Utility layer - errors, identifiers, helpers

// Export main types
pub use util::errors::*;

// Export service layer components
pub use service::config::CoreConfig;

// Export infrastructure components
pub use infrastructure::{
    ai::{ModelInfo, ModelProvider, ProviderError, StreamEvent, StreamRequest},
    logging::{init_logging, LogConfig},
    storage::{FileStorage, MemoryStorage, Storage},
};

// Export Agentic service core types
pub use agentic::{
    coordination::{PromptInput, PromptPart, SessionCoordinator},
    events::{CoreEvent, EventBus},
    execution::StreamProcessor,
    hooks::Plugin,
    permission::{PermissionGate, PermissionResponse},
    runtime::{AgentRuntime, AgentRuntimeBuilder},
    tools::{Tool, ToolContext, ToolRegistry},
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const CORE_NAME: &str = "Steward Core";
