//! Transport addresses.
//!
//! An [`Address`] is the `(host, port)` pair of one side of a WebSocket
//! connection.  Each session has two of them:
//!
//! - `send`: the broker's own socket side (`local_addr`).
//! - `receive`: the peer's side (`peer_addr`).
//!
//! Peers name each other by these addresses, so they travel on the wire as a
//! JSON two-element array:
//!
//! ```json
//! {"send": ["10.0.0.2", 8500], "receive": ["10.0.0.7", 51234]}
//! ```

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

/// Error returned when a JSON value is not a valid `[host, port]` pair.
#[derive(Debug, Error, PartialEq)]
pub enum AddressError {
    /// The field holding the address was absent.
    #[error("missing address field '{0}'")]
    Missing(&'static str),

    /// The value was present but not a `[string, u16]` array.
    #[error("malformed address: {0}")]
    Malformed(String),
}

/// One side of a transport connection.
///
/// Ordering and hashing are derived so addresses can key `BTreeMap`s and
/// `HashMap`s directly.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    /// Host part: an IP literal as produced by the socket layer.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Address {
    /// Creates an address from its parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses an address out of an arbitrary JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`AddressError::Malformed`] unless `value` is an array of
    /// exactly a string and an integer in `0..=65535`.
    pub fn from_value(value: &Value) -> Result<Self, AddressError> {
        serde_json::from_value(value.clone())
            .map_err(|_| AddressError::Malformed(value.to_string()))
    }

    /// Reads the address stored under `field` of a JSON object.
    ///
    /// # Errors
    ///
    /// [`AddressError::Missing`] when the field is absent, otherwise the
    /// errors of [`Address::from_value`].
    pub fn from_field(
        object: &serde_json::Map<String, Value>,
        field: &'static str,
    ) -> Result<Self, AddressError> {
        let value = object.get(field).ok_or(AddressError::Missing(field))?;
        Self::from_value(value)
    }

    /// The JSON array form, `["host", port]`.
    pub fn to_value(&self) -> Value {
        Value::Array(vec![Value::String(self.host.clone()), Value::from(self.port)])
    }

    /// Canonical string key used by storage backends that index addresses
    /// as text.  Two equal addresses always produce the same key.
    pub fn key(&self) -> String {
        self.to_value().to_string()
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.host, self.port).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (host, port) = <(String, u16)>::deserialize(deserializer)?;
        Ok(Self { host, port })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
