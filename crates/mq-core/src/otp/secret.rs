//! Base32 secret normalization.
//!
//! Peers may present either a proper base32 secret (`JBSWY3DPEHPK3PXP`) or
//! an arbitrary string such as a device identifier.  Both are accepted:
//!
//! 1. If the string is strict upper-case base32 it is used as is.  Missing
//!    `=` padding is restored before the check, so a canonical secret read
//!    back from an otpauth URI is recognised again.
//! 2. Otherwise its UTF-8 bytes are base32-encoded.
//!
//! In both cases trailing `=` padding is stripped, which gives a canonical
//! form for comparison and for the otpauth URI.

use data_encoding::{BASE32, BASE32_NOPAD};

use super::verifier::VerifyError;

/// Coerces `secret` into canonical unpadded base32.
///
/// Decoding is strict apart from padding: a string of impossible length or
/// with non-zero trailing bits is treated as raw bytes and encoded.
pub fn normalize(secret: &str) -> String {
    let padding = (8 - secret.len() % 8) % 8;
    let padded = format!("{secret}{}", "=".repeat(padding));
    let encoded = match BASE32.decode(padded.as_bytes()) {
        Ok(_) => secret.to_string(),
        Err(_) => BASE32.encode(secret.as_bytes()),
    };
    encoded.trim_end_matches('=').to_string()
}

/// Decodes a normalized secret into the HMAC key bytes.
///
/// # Errors
///
/// Returns [`VerifyError::InvalidSecret`] if `normalized` is not valid
/// unpadded base32 (for example a secret taken verbatim from an otpauth URI
/// that was never passed through [`normalize`]).
pub fn decode(normalized: &str) -> Result<Vec<u8>, VerifyError> {
    let upper = normalized.trim_end_matches('=').to_ascii_uppercase();
    BASE32_NOPAD
        .decode(upper.as_bytes())
        .map_err(|e| VerifyError::InvalidSecret(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_base32_is_kept() {
        assert_eq!(normalize("JBSWY3DPEHPK3PXP"), "JBSWY3DPEHPK3PXP");
    }

    #[test]
    fn test_padding_is_stripped() {
        // "hello" encodes to NBSWY3DP with no padding; "hi" needs padding.
        assert_eq!(normalize("NBUQ===="), "NBUQ");
    }

    #[test]
    fn test_raw_string_is_encoded() {
        // Lower-case and '_' are not in the strict base32 alphabet.
        assert_eq!(normalize("secret_key"), "ONSWG4TFORPWWZLZ");
    }

    #[test]
    fn test_unpadded_canonical_secret_is_kept() {
        assert_eq!(normalize("NBUQ"), "NBUQ");
        assert_eq!(normalize(&normalize("hi")), normalize("hi"));
    }

    #[test]
    fn test_base32_of_impossible_length_is_encoded() {
        // Three characters can never be a base32 group, so the raw bytes are
        // encoded instead.
        let normalized = normalize("ABC");
        assert_ne!(normalized, "ABC");
        assert_eq!(decode(&normalized).unwrap(), b"ABC");
    }

    #[test]
    fn test_decode_round_trips_normalized_raw_secret() {
        let normalized = normalize("b8d4bc91c784");
        assert_eq!(decode(&normalized).unwrap(), b"b8d4bc91c784");
    }

    #[test]
    fn test_decode_accepts_lower_case() {
        assert_eq!(decode("jbswy3dpehpk3pxp").unwrap(), decode("JBSWY3DPEHPK3PXP").unwrap());
    }

    #[test]
    fn test_decode_rejects_invalid_alphabet() {
        assert!(matches!(decode("not base32!"), Err(VerifyError::InvalidSecret(_))));
    }
}
