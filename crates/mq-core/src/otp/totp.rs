//! RFC 4226 (HOTP) and RFC 6238 (TOTP) code generation.
//!
//! A TOTP code is an HOTP code whose counter is the number of whole
//! `interval`-second steps since the Unix epoch:
//!
//! ```text
//! counter = floor(timestamp / interval)
//! hash    = HMAC-<algorithm>(key, counter as 8-byte big-endian)
//! offset  = hash[last] & 0x0f
//! value   = hash[offset..offset + 4] as u32 & 0x7fff_ffff
//! code    = value mod 10^digits, left-padded with zeros
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha512};

use super::secret;
use super::verifier::VerifyError;

/// Largest supported code length.  `10^10` already exceeds the 31-bit
/// truncated value, so longer codes would only add leading zeros.
pub const MAX_DIGITS: u32 = 10;

/// HMAC digest used to derive codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    /// HMAC-SHA-1, the authenticator-app default.
    #[default]
    Sha1,
    /// HMAC-SHA-256.
    Sha256,
    /// HMAC-SHA-512.
    Sha512,
}

impl Algorithm {
    /// Lower-case name as used in otpauth URIs and handshake requests.
    pub fn as_str(self) -> &'static str {
        match self {
            Algorithm::Sha1 => "sha1",
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = VerifyError;

    /// Case-insensitive; accepts both `sha1` and `SHA-1` spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "sha1" => Ok(Algorithm::Sha1),
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            _ => Err(VerifyError::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

macro_rules! hmac_digest {
    ($digest:ty, $key:expr, $msg:expr) => {{
        let mut mac = <Hmac<$digest>>::new_from_slice($key)
            .map_err(|e| VerifyError::InvalidSecret(e.to_string()))?;
        mac.update($msg);
        mac.finalize().into_bytes().to_vec()
    }};
}

/// Computes the HOTP value for `counter`.
///
/// # Errors
///
/// Returns [`VerifyError::InvalidDigits`] when `digits` is zero or larger
/// than [`MAX_DIGITS`].
pub fn hotp(
    key: &[u8],
    counter: u64,
    digits: u32,
    algorithm: Algorithm,
) -> Result<String, VerifyError> {
    if digits == 0 || digits > MAX_DIGITS {
        return Err(VerifyError::InvalidDigits(digits));
    }

    let msg = counter.to_be_bytes();
    let hash = match algorithm {
        Algorithm::Sha1 => hmac_digest!(Sha1, key, &msg),
        Algorithm::Sha256 => hmac_digest!(Sha256, key, &msg),
        Algorithm::Sha512 => hmac_digest!(Sha512, key, &msg),
    };

    // Dynamic truncation (RFC 4226 §5.3).  Every supported digest is at
    // least 20 bytes, so `offset + 3` is always in range.
    let offset = usize::from(hash[hash.len() - 1] & 0x0f);
    let value = u32::from_be_bytes([
        hash[offset] & 0x7f,
        hash[offset + 1],
        hash[offset + 2],
        hash[offset + 3],
    ]);

    let modulus = 10u64.pow(digits);
    let code = u64::from(value) % modulus;
    Ok(format!("{code:0width$}", width = digits as usize))
}

/// Generates the TOTP code for a normalized base32 secret at `timestamp`.
///
/// # Errors
///
/// - [`VerifyError::InvalidInterval`] when `interval` is zero.
/// - [`VerifyError::InvalidSecret`] when the secret is not base32.
/// - [`VerifyError::InvalidDigits`] as for [`hotp`].
pub fn generate(
    secret_b32: &str,
    interval: u64,
    digits: u32,
    algorithm: Algorithm,
    timestamp: u64,
) -> Result<String, VerifyError> {
    if interval == 0 {
        return Err(VerifyError::InvalidInterval);
    }
    let key = secret::decode(secret_b32)?;
    hotp(&key, timestamp / interval, digits, algorithm)
}

/// Seconds since the Unix epoch, or zero if the system clock is set before it.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
