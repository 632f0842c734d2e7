use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Busy,
    Retry {
        attempt: u32,
        message: String,
        /// Epoch millis of the next attempt
        next: i64,
    },
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::Idle
    }
}
