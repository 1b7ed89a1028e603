//! Infrastructure layer for the relay client.

pub mod network;

pub use network::{ClientError, Frame, RelayClient, RESPONSE_TIMEOUT};
