//! mq-broker library crate.
//!
//! A credential-gated, address-keyed message relay.  Peers connect over
//! WebSocket, authenticate with a TOTP handshake and then exchange JSON
//! messages by naming each other's transport address.  The store is the
//! rendezvous buffer between them.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! Peers (JSON over WebSocket)
//!         ↕
//! [mq-broker]
//!   ├── domain/            Config schema, stored records
//!   ├── application/       Store port, per-connection session state machine
//!   └── infrastructure/
//!         ├── storage/     MemoryStore, SqliteStore (sqlx)
//!         ├── notifier/    In-process delivery wake-ups
//!         ├── connection/  select! loop over one WebSocket
//!         └── ws_server/   Accept loop (tokio-tungstenite)
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O beyond the config file.
//! - `application` depends on `domain`, `mq-core` and the `Store` trait only.
//! - `infrastructure` depends on all other layers plus `tokio`, `sqlx` and
//!   `tungstenite`.

/// Domain layer: configuration and stored documents.
pub mod domain;

/// Application layer: storage port and session logic.
pub mod application;

/// Infrastructure layer: storage backends, WebSocket server, connections.
pub mod infrastructure;
