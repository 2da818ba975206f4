//! Key derivation for abuse-control state.
//!
//! All limiter and blacklist state is keyed by opaque identifiers derived here:
//! a client IP, a normalized email, or a truncated token digest. Raw credentials
//! and raw tokens are never used as keys and never stored.

use base64ct::{Base64UrlUnpadded, Encoding};
use sha2::{Digest, Sha256};

/// Number of digest bytes kept when deriving a token id.
///
/// 16 bytes of SHA-256 output is collision-resistant far beyond the blacklist's
/// lifetime while keeping per-entry memory bounded.
const TOKEN_ID_BYTES: usize = 16;

/// Derive a limiter key from the client address.
///
/// # Panics
/// Panics on an empty address; callers must resolve the client address before
/// asking for admission.
#[must_use]
pub fn ip_key(ip: &str) -> String {
    assert!(!ip.trim().is_empty(), "client address key must not be empty");
    format!("ip:{}", ip.trim())
}

/// Derive a limiter key from an account email.
///
/// The email is normalized first so `User@Example.com ` and `user@example.com`
/// throttle the same account.
///
/// # Panics
/// Panics on an empty email.
#[must_use]
pub fn email_key(email: &str) -> String {
    let normalized = normalize_email(email);
    assert!(!normalized.is_empty(), "email key must not be empty");
    format!("email:{normalized}")
}

/// Normalize an email for lookup/uniqueness checks.
#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Derive the opaque blacklist id for a refresh token.
///
/// One-way digest, truncated: the blacklist never needs to recover the token,
/// only to recognize it, so storing a prefix of the hash bounds memory and keeps
/// secrets out of the map.
///
/// # Panics
/// Panics on an empty token.
#[must_use]
pub fn token_id(raw_token: &str) -> String {
    assert!(!raw_token.is_empty(), "token must not be empty");
    let digest = Sha256::digest(raw_token.as_bytes());
    Base64UrlUnpadded::encode_string(&digest[..TOKEN_ID_BYTES])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_key_is_prefixed() {
        assert_eq!(ip_key("203.0.113.7"), "ip:203.0.113.7");
        assert_eq!(ip_key(" 203.0.113.7 "), "ip:203.0.113.7");
    }

    #[test]
    fn email_key_normalizes() {
        assert_eq!(email_key(" User@Example.COM "), "email:user@example.com");
        assert_eq!(email_key("user@example.com"), "email:user@example.com");
    }

    #[test]
    fn token_id_is_stable_and_opaque() {
        let id = token_id("some-refresh-token");
        assert_eq!(id, token_id("some-refresh-token"));
        assert_ne!(id, token_id("some-other-token"));
        // 16 digest bytes encode to 22 base64url characters, no padding.
        assert_eq!(id.len(), 22);
        assert!(!id.contains("some-refresh-token"));
    }

    #[test]
    #[should_panic(expected = "must not be empty")]
    fn empty_key_is_a_programming_error() {
        let _ = ip_key("   ");
    }
}
