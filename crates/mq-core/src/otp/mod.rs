//! One-time password credential verification.
//!
//! A peer authenticates by presenting a shared secret plus a time-based
//! one-time code it computed itself.  The broker recomputes the code and
//! compares.
//!
//! ```text
//! secret ──► secret::normalize ──► base32, no padding
//!    │
//!    └─(contains "otpauth")──► otpauth::parse_query ──► overrides
//!
//! normalized credential ──► totp::generate ──► code ──► compare with the
//!                                                       peer's own values
//! ```
//!
//! - [`secret`]: base32 coercion of raw or encoded secrets.
//! - [`otpauth`]: `otpauth://totp/...` parsing and construction.
//! - [`totp`]: RFC 4226 / RFC 6238 code generation.
//! - [`verifier`]: the `verify` entry point that ties the above together.

pub mod otpauth;
pub mod secret;
pub mod totp;
pub mod verifier;

pub use totp::{generate, unix_now, Algorithm};
pub use verifier::{verify, Credential, Verification, VerifyError, VerifyParams};
