//! # mq-core
//!
//! Shared library for the MQ relay: transport addresses, the one-time
//! password verifier, the directory filter language, and the JSON frames
//! exchanged over the WebSocket.
//!
//! This crate is used by both the broker and the client.  It has no
//! dependencies on sockets or on an async runtime, so everything in it can be
//! unit tested synchronously.
//!
//! # Architecture overview
//!
//! The relay lets heterogeneous peers (clients, admin consoles, worker
//! servers) exchange arbitrary JSON payloads by naming each other's transport
//! address.  Every connection starts with a TOTP handshake; afterwards the
//! broker stores submitted messages and forwards them to the addressed peer.
//!
//! - **`domain`** – Pure value types.  `Address` is the correlation key used
//!   everywhere; `Filter` evaluates directory queries against JSON records.
//!
//! - **`otp`** – The credential verifier: base32 secret coercion, otpauth URI
//!   parsing/building and RFC 6238 code generation.
//!
//! - **`protocol`** – The frames on the wire: handshake request/reply,
//!   status replies, error frames and the classification of inbound frames.

pub mod domain;
pub mod otp;
pub mod protocol;

pub use domain::address::{Address, AddressError};
pub use domain::filter::{Filter, FilterError};
pub use otp::verifier::{verify, Credential, Verification, VerifyError, VerifyParams};
pub use protocol::messages::{
    ErrorFrame, FrameError, HandshakeOutcome, HandshakeReply, HandshakeRequest, Inbound,
    StatusReply,
};
