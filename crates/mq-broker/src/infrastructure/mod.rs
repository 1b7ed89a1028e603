//! Infrastructure layer for mq-broker.
//!
//! The infrastructure layer handles all I/O: the storage backends, the
//! WebSocket listener and the per-connection driver.
//!
//! # Responsibilities
//!
//! - Opening the configured store and applying the startup reset
//! - Binding a TCP listener and performing the WebSocket upgrade
//! - Spawning one Tokio task per connection
//! - Running the select loop of an authenticated session (peer frames,
//!   delivery notifications, poll ticks, keepalive)
//! - Guaranteeing teardown cleanup on every exit path
//!
//! # What does NOT belong here?
//!
//! - Handshake and relay decisions (that is the application layer)
//! - Config and record types (that is the domain layer)

pub mod connection;
pub mod notifier;
pub mod storage;
pub mod ws_server;

pub use connection::{serve_connection, ConnectionContext, ConnectionSettings};
pub use notifier::DeliveryNotifier;
pub use storage::{open_store, MemoryStore, SqliteStore};
pub use ws_server::{run_server, WsServer};
