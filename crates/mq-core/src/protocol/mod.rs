//! Protocol module containing the JSON frames exchanged with the broker.

pub mod messages;

pub use messages::*;
