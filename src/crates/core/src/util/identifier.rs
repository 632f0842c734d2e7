//! Creation-order sortable identifiers
//!
//! Layout: `<prefix>_<16 hex: (millis << 12) | counter><14 base62 random>`.
//! The hex section is fixed width, so plain string comparison follows
//! creation order within one process.

use rand::Rng;
use std::sync::Mutex;

const RANDOM_LEN: usize = 14;
const BASE62: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdPrefix {
    Session,
    Message,
    Part,
    Permission,
}

impl IdPrefix {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdPrefix::Session => "ses",
            IdPrefix::Message => "msg",
            IdPrefix::Part => "prt",
            IdPrefix::Permission => "per",
        }
    }
}

struct Clock {
    last_ms: i64,
    counter: u64,
}

static CLOCK: Mutex<Clock> = Mutex::new(Clock {
    last_ms: 0,
    counter: 0,
});

fn next_sequence() -> u64 {
    let now = chrono::Utc::now().timestamp_millis();
    let mut clock = CLOCK.lock().unwrap_or_else(|e| e.into_inner());
    // Never step backwards, even when the wall clock does.
    if now > clock.last_ms {
        clock.last_ms = now;
        clock.counter = 0;
    } else {
        clock.counter += 1;
    }
    ((clock.last_ms.max(0) as u64) << 12) + clock.counter
}

/// Returns a new id that sorts after every id previously returned.
pub fn ascending(prefix: IdPrefix) -> String {
    let sequence = next_sequence();
    let mut rng = rand::thread_rng();
    let random: String = (0..RANDOM_LEN)
        .map(|_| BASE62[rng.gen_range(0..BASE62.len())] as char)
        .collect();
    format!("{}_{:016x}{}", prefix.as_str(), sequence, random)
}
