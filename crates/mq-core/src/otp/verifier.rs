//! The credential verifier.
//!
//! [`verify`] takes the fields of a handshake request, recomputes the TOTP
//! code for the presented secret and reports whether the peer supplied the
//! same code anywhere among its extra fields.  The key under which the peer
//! places its code is deliberately not fixed: every string value of the
//! extra fields is compared.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use super::otpauth;
use super::secret;
use super::totp::{self, Algorithm};

/// Errors raised while verifying a credential.
///
/// The broker folds every one of these into an unverified handshake reply;
/// none of them terminates a session.
#[derive(Debug, Error, PartialEq)]
pub enum VerifyError {
    /// An otpauth query value that must be an integer was not one.
    #[error("invalid value for '{field}': {value:?}")]
    InvalidParameter { field: &'static str, value: String },

    /// The requested HMAC digest is not supported.
    #[error("unsupported algorithm '{0}'")]
    UnsupportedAlgorithm(String),

    /// The time step was zero.
    #[error("interval must be at least one second")]
    InvalidInterval,

    /// The code length was outside `1..=10`.
    #[error("digits must be between 1 and 10, got {0}")]
    InvalidDigits(u32),

    /// The secret could not be decoded as base32.
    #[error("invalid secret: {0}")]
    InvalidSecret(String),
}

/// Caller-supplied verification arguments.
///
/// [`Default`] gives the standard authenticator parameters: 30-second steps,
/// six digits, SHA-1, current time.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyParams {
    /// Raw secret or a string containing an otpauth URI.  `None` yields a
    /// null result.
    pub secret: Option<String>,
    pub interval: u64,
    pub digits: u32,
    pub algorithm: String,
    /// Unix time to verify at; `None` or `Some(0)` means "now".
    pub timestamp: Option<u64>,
    pub label: String,
    pub issuer: String,
    /// Every other field of the request.  The peer's own code lives here.
    pub extra: Map<String, Value>,
}

impl Default for VerifyParams {
    fn default() -> Self {
        Self {
            secret: None,
            interval: 30,
            digits: 6,
            algorithm: Algorithm::default().as_str().to_string(),
            timestamp: None,
            label: String::new(),
            issuer: String::new(),
            extra: Map::new(),
        }
    }
}

/// Normalized credential fields, as reported back to the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    /// Canonical unpadded base32 secret.
    pub secret: String,
    /// The `secret` field exactly as presented (possibly a whole URI).
    pub original_secret: String,
    pub interval: u64,
    pub digits: u32,
    pub algorithm: String,
    pub timestamp: u64,
    pub issuer: String,
    pub label: String,
}

/// The verifier's verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    #[serde(flatten)]
    pub credential: Credential,
    /// The extra request fields, echoed back.
    pub parameters: Map<String, Value>,
    /// The code the broker computed.
    pub code: String,
    /// Reconstructed key-URI for diagnostics or re-provisioning.
    pub otpauth_uri: String,
    pub verified: bool,
}

/// Verifies a credential at `now` (Unix seconds) unless the params pin a
/// timestamp.
///
/// Returns `Ok(None)` when no secret was supplied.
///
/// # Errors
///
/// - [`VerifyError::InvalidParameter`] if an otpauth URI carries a
///   non-integer `digits`, `period`/`interval` or `timestamp`/`utc`.
/// - [`VerifyError::UnsupportedAlgorithm`], [`VerifyError::InvalidInterval`]
///   and [`VerifyError::InvalidDigits`] for out-of-range parameters.
pub fn verify(params: &VerifyParams, now: u64) -> Result<Option<Verification>, VerifyError> {
    let Some(original_secret) = params.secret.clone() else {
        return Ok(None);
    };

    let mut raw_secret = original_secret.clone();
    let mut interval = params.interval;
    let mut digits = params.digits;
    let mut algorithm = params.algorithm.clone();
    let mut issuer = params.issuer.clone();
    let mut timestamp = params.timestamp.filter(|t| *t != 0).unwrap_or(now);

    // A descriptor overrides exactly the fields present in its query string.
    if original_secret.contains("otpauth") {
        let query = otpauth::parse_query(&original_secret);
        if let Some(v) = query.get("timestamp").or_else(|| query.get("utc")) {
            timestamp = parse_int("timestamp", v)?;
        }
        if let Some(v) = query.get("secret") {
            raw_secret = v.clone();
        }
        if let Some(v) = query.get("issuer") {
            issuer = v.clone();
        }
        if let Some(v) = query.get("algorithm") {
            algorithm = v.clone();
        }
        if let Some(v) = query.get("digits") {
            digits = parse_int("digits", v)?;
        }
        if let Some(v) = query.get("period").or_else(|| query.get("interval")) {
            interval = parse_int("interval", v)?;
        }
    }

    let digest: Algorithm = algorithm.parse()?;
    let secret = secret::normalize(&raw_secret);
    let code = totp::generate(&secret, interval, digits, digest, timestamp)?;

    let label = if params.label.is_empty() {
        format!("default:{timestamp}")
    } else {
        params.label.clone()
    };

    let credential = Credential {
        secret,
        original_secret,
        interval,
        digits,
        algorithm: digest.as_str().to_string(),
        timestamp,
        issuer,
        label,
    };
    let verified = params
        .extra
        .values()
        .any(|value| value.as_str() == Some(code.as_str()));
    let otpauth_uri = otpauth::build(&credential);
    debug!(
        algorithm = digest.as_str(),
        digits,
        interval,
        verified,
        "computed one-time code"
    );

    Ok(Some(Verification {
        credential,
        parameters: params.extra.clone(),
        code,
        otpauth_uri,
        verified,
    }))
}

fn parse_int<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, VerifyError> {
    value
        .trim()
        .parse()
        .map_err(|_| VerifyError::InvalidParameter {
            field,
            value: value.to_string(),
        })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
