//! # mq-client
//!
//! Peer-side library for the MQ relay broker.
//!
//! A peer connects over WebSocket, proves it holds a TOTP secret, and is
//! then known to the broker (and to every other peer) by the transport
//! address the broker saw.  From then on it can:
//!
//! - submit messages addressed to another peer's address,
//! - query the directory of connected peers,
//! - receive messages other peers addressed to it.
//!
//! # Architecture overview
//!
//! - **`infrastructure::network`** – [`RelayClient`], one WebSocket
//!   connection with request/response helpers and a buffer for relayed
//!   messages that arrive while an answer is awaited.
//!
//! The frame types and the handshake request builder live in `mq-core` and
//! are re-exported here for convenience.

pub mod infrastructure;

pub use infrastructure::network::{ClientError, Frame, RelayClient};
pub use mq_core::{Address, HandshakeReply, HandshakeRequest, StatusReply};
