pub mod errors;
pub mod identifier;
pub mod token;
pub mod wildcard;

pub use errors::*;
pub use identifier::{ascending, IdPrefix};
