//! Agentic service layer
//!
//! Agents, the turn loop, stream processing, tools and the permission gate.

pub mod agents;
pub mod coordination;
pub mod core;
pub mod events;
pub mod execution;
pub mod hooks;
pub mod permission;
pub mod runtime;
pub mod session;
pub mod tools;

pub use runtime::{AgentRuntime, AgentRuntimeBuilder};
