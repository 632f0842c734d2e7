//! Core data model helpers
//!
//! History filtering and conversion into provider messages.

pub mod messages_helper;

pub use messages_helper::{filter_compacted, new_assistant, to_model_messages};
