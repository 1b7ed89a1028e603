//! Documents kept by the store.
//!
//! All three tables hold schemaless JSON objects.  The structs here pair each
//! document with the address it is indexed by so backends never have to dig
//! the key out of the JSON themselves.

use mq_core::protocol::messages::RECEIVE_KEY;
use mq_core::{Address, AddressError, HandshakeReply};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A JSON object as stored and returned by the store.
pub type Document = Map<String, Value>;

/// A message waiting for its destination to pick it up.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    /// Destination, read from the message's own `receive` field.
    pub receive: Address,
    /// The message exactly as submitted.
    pub body: Document,
}

impl QueuedMessage {
    /// Wraps a submitted message, reading its destination.
    ///
    /// # Errors
    ///
    /// Returns an [`AddressError`] if `receive` is missing or malformed.
    pub fn from_body(body: Document) -> Result<Self, AddressError> {
        let receive = Address::from_field(&body, RECEIVE_KEY)?;
        Ok(Self { receive, body })
    }
}

/// Directory entry for an authenticated peer.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub receive: Address,
    /// The handshake reply the peer received.
    pub document: Document,
}

impl DeviceRecord {
    /// Builds the directory entry from a handshake reply.
    pub fn from_reply(reply: &HandshakeReply) -> Result<Self, serde_json::Error> {
        Ok(Self {
            receive: reply.receive.clone(),
            document: to_document(reply)?,
        })
    }
}

/// One audit row per connection.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub receive: Address,
    pub document: Document,
}

impl AuditRecord {
    /// The row written when the handshake completes.
    pub fn from_reply(reply: &HandshakeReply) -> Result<Self, serde_json::Error> {
        Ok(Self {
            receive: reply.receive.clone(),
            document: to_document(reply)?,
        })
    }

    /// The bare row for a connection whose handshake left no audit entry.
    pub fn unverified(send: &Address, receive: &Address) -> Self {
        let document = Map::from_iter([
            ("send".to_string(), send.to_value()),
            (RECEIVE_KEY.to_string(), receive.to_value()),
            ("verified".to_string(), Value::Bool(false)),
        ]);
        Self {
            receive: receive.clone(),
            document,
        }
    }

    /// The same row with the teardown summary attached under `delete`.
    pub fn with_delete(mut self, summary: DeleteSummary) -> Self {
        self.document.insert(
            "delete".to_string(),
            serde_json::json!({ "device": summary.device, "mq": summary.mq }),
        );
        self
    }
}

/// Row identifier returned by `append_audit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuditId(pub i64);

/// What teardown removed for one address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteSummary {
    /// Whether a directory row existed.
    pub device: bool,
    /// Number of undelivered messages discarded.
    pub mq: u64,
}

/// Row counts of the three tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub queued: u64,
    pub devices: u64,
    pub audit: u64,
}

fn to_document<T: Serialize>(value: &T) -> Result<Document, serde_json::Error> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Ok(Map::from_iter([("value".to_string(), other)])),
    }
}
