//! Coordination Layer
//!
//! Owns the per-session turn loop and the background jobs it starts.

pub mod session_loop;
pub mod title;

pub use session_loop::{LoopResult, PromptInput, PromptPart, SessionCoordinator};
pub use title::{clean_title, ensure_title};
