//! `otpauth://` URI handling.
//!
//! Peers may place a whole key-URI in the `secret` field instead of a bare
//! secret:
//!
//! ```text
//! otpauth://totp/ACME:alice?secret=JBSWY3DPEHPK3PXP&period=30&digits=6&algorithm=sha1&timestamp=1700000000
//! ```
//!
//! Only the query string matters to verification.  Blank values are treated
//! as absent and the first occurrence of a repeated key wins.

use std::collections::HashMap;

use url::form_urlencoded;

use super::verifier::Credential;

/// Extracts the non-blank query parameters of an otpauth-style URI.
///
/// Anything before the first `?` and after the first `#` is ignored, so a
/// string that merely *contains* a URI still yields its parameters.
pub fn parse_query(uri: &str) -> HashMap<String, String> {
    let Some((_, rest)) = uri.split_once('?') else {
        return HashMap::new();
    };
    let query = rest.split('#').next().unwrap_or_default();

    let mut params = HashMap::new();
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        if value.is_empty() {
            continue;
        }
        params
            .entry(key.into_owned())
            .or_insert_with(|| value.into_owned());
    }
    params
}

/// Builds the diagnostic URI returned to peers.
///
/// The path is the percent-encoded label (`default:<timestamp>` when the
/// caller supplied none).  The query carries the fields that determine the
/// code, under the keys [`parse_query`] reads back, so feeding the URI into
/// the verifier reproduces the same credential.  The computed code, the
/// verdict and the secret as presented are not part of it.
pub fn build(credential: &Credential) -> String {
    let fields: [(&str, String); 6] = [
        ("secret", credential.secret.clone()),
        ("issuer", credential.issuer.clone()),
        ("algorithm", credential.algorithm.clone()),
        ("digits", credential.digits.to_string()),
        ("period", credential.interval.to_string()),
        ("timestamp", credential.timestamp.to_string()),
    ];
    let query = fields
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    format!(
        "otpauth://totp/{}?{}",
        urlencoding::encode(&credential.label),
        query
    )
}
