//! AI provider module
//!
//! The provider contract the core streams through, plus the neutral
//! request/event types shared with provider adapters.

pub mod error;
pub mod provider;
pub mod types;

pub use error::ProviderError;
pub use provider::{EventStream, ModelProvider};
pub use types::*;
