//! JSON frames exchanged between peers and the broker.
//!
//! Every WebSocket text frame carries one JSON value.  Apart from the bare
//! count frame that opens a query response, every frame is a JSON object.
//!
//! # Message flow
//!
//! ```text
//! Peer   → Broker:  HandshakeRequest          (first frame)
//! Broker → Peer:    HandshakeReply
//!
//! Peer   → Broker:  {"$query": {...}}         → "<count>", record, record, ...
//! Peer   → Broker:  {"send":..,"receive":..}  → StatusReply
//! Broker → Peer:    relayed message (send/receive swapped)
//! Broker → Peer:    ErrorFrame
//! ```
//!
//! Handshake requests and relayed payloads are open-ended: any field the
//! broker does not recognise is carried along untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::address::Address;
use crate::otp::secret;
use crate::otp::totp::{self, Algorithm};
use crate::otp::verifier::{Verification, VerifyError, VerifyParams};

/// Key that marks an inbound frame as a directory query.
pub const QUERY_KEY: &str = "$query";

/// Field naming the submitting peer's address.
pub const SEND_KEY: &str = "send";

/// Field naming the destination peer's address.
pub const RECEIVE_KEY: &str = "receive";

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors raised while interpreting a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The frame was not valid JSON (or not the expected shape).
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame was valid JSON but not an object.
    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),

    /// A required field was missing.
    #[error("missing field '{0}'")]
    MissingField(&'static str),
}

// ── Handshake ─────────────────────────────────────────────────────────────────

/// The first frame a peer sends.
///
/// ```json
/// {"secret":"JBSWY3DPEHPK3PXP","code":"324550","type":"worker"}
/// ```
///
/// Only `secret` is needed; everything not listed below lands in
/// [`extra`](Self::extra), which is where the peer's own code is expected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Usually a string.  Other JSON values are accepted and verified
    /// against their JSON text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digits: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
    /// Older peers call this field `utc`.
    #[serde(default, alias = "utc", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl HandshakeRequest {
    /// Builds a request carrying `secret` and the code it yields right now
    /// with the default parameters (30 s, 6 digits, SHA-1), under `code`.
    ///
    /// # Errors
    ///
    /// Only fails if the default parameters are rejected, which they are not;
    /// the `Result` mirrors [`totp::generate`].
    pub fn for_secret(secret: &str) -> Result<Self, VerifyError> {
        let code = totp::generate(
            &secret::normalize(secret),
            30,
            6,
            Algorithm::Sha1,
            totp::unix_now(),
        )?;

        let mut request = Self {
            secret: Some(Value::String(secret.to_string())),
            ..Self::default()
        };
        request.extra.insert("code".to_string(), Value::String(code));
        Ok(request)
    }

    /// Adds an extra field (for example a device `type` for directory
    /// queries).
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Converts the request into verifier arguments, filling defaults for
    /// absent fields.
    pub fn into_params(self) -> VerifyParams {
        let defaults = VerifyParams::default();
        let secret = match self.secret {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(other) => Some(other.to_string()),
        };
        VerifyParams {
            secret,
            interval: self.interval.unwrap_or(defaults.interval),
            digits: self.digits.unwrap_or(defaults.digits),
            algorithm: self.algorithm.unwrap_or(defaults.algorithm),
            timestamp: self.timestamp,
            label: self.label.unwrap_or_default(),
            issuer: self.issuer.unwrap_or_default(),
            extra: self.extra,
        }
    }
}

/// What the verifier concluded, flattened into the [`HandshakeReply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HandshakeOutcome {
    /// The verifier ran; `verified` may still be `false`.
    Computed(Box<Verification>),
    /// The handshake never reached a verdict (timeout, bad JSON, no secret,
    /// verifier error).
    Failed { verified: bool },
}

/// The broker's answer to the handshake.
///
/// ```json
/// {"secret":"JBSWY3DPEHPK3PXP", ..., "verified":true,
///  "send":["0.0.0.0",8500], "receive":["10.0.0.7",51234]}
/// ```
///
/// On failure only `verified: false`, the two addresses and `message` are
/// present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeReply {
    #[serde(flatten)]
    pub outcome: HandshakeOutcome,
    /// The broker's side of the connection.
    pub send: Address,
    /// The peer's side of the connection; its identity from now on.
    pub receive: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HandshakeReply {
    /// Reply for a handshake that produced a verification result.
    pub fn computed(verification: Verification, send: Address, receive: Address) -> Self {
        Self {
            outcome: HandshakeOutcome::Computed(Box::new(verification)),
            send,
            receive,
            message: None,
        }
    }

    /// Reply for a handshake that failed before a verdict was reached.
    pub fn failed(send: Address, receive: Address, message: impl Into<String>) -> Self {
        Self {
            outcome: HandshakeOutcome::Failed { verified: false },
            send,
            receive,
            message: Some(message.into()),
        }
    }

    pub fn verified(&self) -> bool {
        match &self.outcome {
            HandshakeOutcome::Computed(v) => v.verified,
            HandshakeOutcome::Failed { verified } => *verified,
        }
    }
}

// ── Authenticated loop ────────────────────────────────────────────────────────

/// Classification of a frame received after the handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Nothing to act on (`{}`).
    Empty,
    /// A directory query; the value is the raw filter document.
    Query(Value),
    /// A message to store for another peer.
    Message(Map<String, Value>),
}

impl Inbound {
    /// Parses a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Json`] for malformed JSON and
    /// [`FrameError::NotAnObject`] for JSON arrays, strings and the like.
    /// The broker treats both as [`Inbound::Empty`].
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Classifies an already-parsed value.
    pub fn from_value(value: Value) -> Result<Self, FrameError> {
        let mut map = match value {
            Value::Object(map) => map,
            other => return Err(FrameError::NotAnObject(json_kind(&other))),
        };
        if let Some(filter) = map.remove(QUERY_KEY) {
            return Ok(Inbound::Query(filter));
        }
        if map.is_empty() {
            Ok(Inbound::Empty)
        } else {
            Ok(Inbound::Message(map))
        }
    }
}

/// Answer to a submitted message.
///
/// `send` and `receive` echo the submitted fields; they are `null` when the
/// message lacked them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReply {
    pub status: bool,
    pub send: Value,
    pub receive: Value,
}

impl StatusReply {
    /// Builds the reply for `message`, echoing its endpoint fields.
    pub fn for_message(message: &Map<String, Value>, status: bool) -> Self {
        Self {
            status,
            send: message.get(SEND_KEY).cloned().unwrap_or(Value::Null),
            receive: message.get(RECEIVE_KEY).cloned().unwrap_or(Value::Null),
        }
    }
}

/// `{"error": "..."}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub error: String,
}

impl ErrorFrame {
    pub fn new(error: impl std::fmt::Display) -> Self {
        Self {
            error: error.to_string(),
        }
    }
}

/// The frame that opens a query response: the match count as a bare string.
pub fn count_frame(count: u64) -> String {
    count.to_string()
}

/// Swaps `send` and `receive` in place, turning a stored message into the
/// frame delivered to its destination.
///
/// # Errors
///
/// Returns [`FrameError::MissingField`] if either field is absent; the
/// message is left unchanged.
pub fn swap_endpoints(message: &mut Map<String, Value>) -> Result<(), FrameError> {
    let send = message
        .remove(SEND_KEY)
        .ok_or(FrameError::MissingField(SEND_KEY))?;
    let Some(receive) = message.remove(RECEIVE_KEY) else {
        message.insert(SEND_KEY.to_string(), send);
        return Err(FrameError::MissingField(RECEIVE_KEY));
    };
    message.insert(SEND_KEY.to_string(), receive);
    message.insert(RECEIVE_KEY.to_string(), send);
    Ok(())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
