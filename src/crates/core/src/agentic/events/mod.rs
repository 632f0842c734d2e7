//! Event Layer
//!
//! Typed core events and the bus that fans them out.

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventCallback, SubscriptionId};
pub use types::CoreEvent;
