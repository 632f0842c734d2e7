//! Execution Engine Layer
//!
//! Stream processing and retry policy for a single inference call.

pub mod retry;
pub mod stream_processor;

pub use stream_processor::{ProcessOutcome, StreamInput, StreamProcessor, DOOM_LOOP_THRESHOLD};
