//! Inbound request authentication.
//!
//! Webhook senders sign the raw request body with HMAC-SHA256 using a secret
//! shared with the relay, and send the lowercase hex digest in the
//! `X-Signature` header. [`verify`] recomputes the digest and compares it in
//! constant time.
//!
//! # Example
//!
//! ```
//! use hec_relay::signature::{sign, verify};
//!
//! let body = br#"{"type":"message.new"}"#;
//! let signature = sign(body, "shared-secret").unwrap();
//!
//! assert!(verify(body, &signature, "shared-secret"));
//! assert!(!verify(body, &signature, "other-secret"));
//! ```

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, error, warn};

type HmacSha256 = Hmac<Sha256>;

/// Outcome of checking a presented signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyResult {
    /// The signature matches the body.
    Valid,
    /// Body, signature or secret was empty.
    Missing,
    /// The signature does not match the body.
    Mismatch,
    /// The MAC could not be keyed with the secret.
    KeyRejected,
}

impl VerifyResult {
    /// Returns true only for [`VerifyResult::Valid`].
    pub fn is_valid(self) -> bool {
        self == VerifyResult::Valid
    }
}

/// Compute the lowercase hex HMAC-SHA256 of `body` keyed with `secret`.
///
/// Returns `None` if the MAC rejects the key.
pub fn sign(body: &[u8], secret: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Check `presented` against the signature of `body`, reporting why a check
/// failed.
pub fn check(body: &[u8], presented: &str, secret: &str) -> VerifyResult {
    if body.is_empty() || presented.is_empty() || secret.is_empty() {
        warn!("Missing body, signature or secret for verification");
        return VerifyResult::Missing;
    }

    let Some(expected) = sign(body, secret) else {
        error!("HMAC-SHA256 rejected the configured secret");
        return VerifyResult::KeyRejected;
    };

    debug!(presented = %presented, "Comparing presented signature");

    if constant_time_eq(expected.as_bytes(), presented.as_bytes()) {
        VerifyResult::Valid
    } else {
        VerifyResult::Mismatch
    }
}

/// Verify a webhook signature. Never panics; any failure is `false`.
pub fn verify(body: &[u8], presented: &str, secret: &str) -> bool {
    check(body, presented, secret).is_valid()
}

/// Compare two byte strings without short-circuiting on the first mismatch.
///
/// Lengths are compared first; equal-length inputs are always scanned in
/// full.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 4231 test case 2
    const RFC_KEY: &str = "Jefe";
    const RFC_DATA: &[u8] = b"what do ya want for nothing?";
    const RFC_DIGEST: &str = "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843";

    #[test]
    fn test_sign_matches_known_vector() {
        assert_eq!(sign(RFC_DATA, RFC_KEY).as_deref(), Some(RFC_DIGEST));
    }

    #[test]
    fn test_verify_valid_signature() {
        assert!(verify(RFC_DATA, RFC_DIGEST, RFC_KEY));
        assert_eq!(check(RFC_DATA, RFC_DIGEST, RFC_KEY), VerifyResult::Valid);
    }

    #[test]
    fn test_uppercase_hex_is_rejected() {
        let upper = RFC_DIGEST.to_uppercase();
        assert_eq!(check(RFC_DATA, &upper, RFC_KEY), VerifyResult::Mismatch);
    }

    #[test]
    fn test_empty_inputs() {
        assert_eq!(check(b"", RFC_DIGEST, RFC_KEY), VerifyResult::Missing);
        assert_eq!(check(RFC_DATA, "", RFC_KEY), VerifyResult::Missing);
        assert_eq!(check(RFC_DATA, RFC_DIGEST, ""), VerifyResult::Missing);
    }

    #[test]
    fn test_wrong_length_signature() {
        assert_eq!(
            check(RFC_DATA, &RFC_DIGEST[..10], RFC_KEY),
            VerifyResult::Mismatch
        );
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"xbc"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }
}
