//! Application layer for mq-broker.
//!
//! Everything here depends on the [`store::Store`] trait rather than on a
//! concrete backend, and nothing here touches a socket.
//!
//! # Sub-modules
//!
//! - **`store`**   – The storage port: queue, directory and audit log
//!   operations, each atomic on the backend.
//!
//! - **`session`** – The per-connection state machine.  Verifies the
//!   handshake, answers queries, queues messages, pops deliveries and runs
//!   the teardown cleanup.

pub mod session;
pub mod store;

pub use session::{
    BrokerContext, HandshakeError, RelayError, Response, Session, SessionPolicy, SessionState,
};
pub use store::{Store, StoreError};
