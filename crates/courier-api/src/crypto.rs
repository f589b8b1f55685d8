//! HMAC-SHA256 signatures for inbound events.
//!
//! Producers sign the raw request body with the shared secret and send
//! `X-Courier-Signature: sha256=<hex>`. Verification decodes the hex and
//! lets `hmac` do the constant-time comparison.

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the body signature.
pub const SIGNATURE_HEADER: &str = "x-courier-signature";

const SIGNATURE_PREFIX: &str = "sha256=";

/// Signature validation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// Missing signature header.
    MissingSignature,
    /// Invalid signature format.
    InvalidFormat(String),
    /// Signature verification failed.
    VerificationFailed,
    /// Invalid secret key.
    InvalidSecret,
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSignature => write!(f, "signature header missing"),
            Self::InvalidFormat(format) => write!(f, "invalid signature format: {format}"),
            Self::VerificationFailed => write!(f, "signature verification failed"),
            Self::InvalidSecret => write!(f, "invalid secret key"),
        }
    }
}

impl std::error::Error for SignatureError {}

fn keyed_mac(secret: &str) -> Result<HmacSha256, SignatureError> {
    if secret.is_empty() {
        return Err(SignatureError::InvalidSecret);
    }
    HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::InvalidSecret)
}

/// Produces the header value for `payload`, `sha256=<lowercase hex>`.
///
/// # Errors
///
/// Returns `SignatureError::InvalidSecret` for an empty secret.
pub fn sign(payload: &[u8], secret: &str) -> Result<String, SignatureError> {
    let mut mac = keyed_mac(secret)?;
    mac.update(payload);
    Ok(format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes())))
}

/// Checks `signature` against the HMAC of `payload`.
///
/// # Example
///
/// ```
/// use courier_api::crypto::{sign, verify_signature};
///
/// let payload = br#"{"id":"evt-1"}"#;
/// let header = sign(payload, "shared-secret").unwrap();
///
/// assert!(verify_signature(payload, &header, "shared-secret").is_ok());
/// assert!(verify_signature(payload, &header, "other-secret").is_err());
/// ```
///
/// # Errors
///
/// Returns why the signature was rejected.
pub fn verify_signature(payload: &[u8], signature: &str, secret: &str) -> Result<(), SignatureError> {
    let signature = signature.trim();
    if signature.is_empty() {
        return Err(SignatureError::MissingSignature);
    }

    let hex_digest = signature.strip_prefix(SIGNATURE_PREFIX).ok_or_else(|| {
        SignatureError::InvalidFormat(format!("expected '{SIGNATURE_PREFIX}<hex>'"))
    })?;
    let expected = hex::decode(hex_digest)
        .map_err(|e| SignatureError::InvalidFormat(format!("signature is not hex: {e}")))?;

    let mut mac = keyed_mac(secret)?;
    mac.update(payload);
    mac.verify_slice(&expected).map_err(|_| SignatureError::VerificationFailed)
}

/// Constant-time equality for bearer tokens.
pub(crate) fn tokens_match(provided: &str, expected: &str) -> bool {
    if provided.len() != expected.len() {
        return false;
    }
    provided.bytes().zip(expected.bytes()).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_payload_verifies() {
        let payload = b"test payload";
        let header = sign(payload, "test_secret").unwrap();

        assert!(header.starts_with("sha256="));
        assert_eq!(header.len(), SIGNATURE_PREFIX.len() + 64);
        assert_eq!(verify_signature(payload, &header, "test_secret"), Ok(()));
    }

    #[test]
    fn tampered_payload_fails() {
        let header = sign(b"original", "test_secret").unwrap();

        assert_eq!(
            verify_signature(b"tampered", &header, "test_secret"),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn malformed_signatures_are_rejected() {
        assert_eq!(verify_signature(b"x", "", "s"), Err(SignatureError::MissingSignature));
        assert!(matches!(
            verify_signature(b"x", "v1=abcd", "s"),
            Err(SignatureError::InvalidFormat(_))
        ));
        assert!(matches!(
            verify_signature(b"x", "sha256=not-hex", "s"),
            Err(SignatureError::InvalidFormat(_))
        ));
        assert_eq!(
            verify_signature(b"x", "sha256=abcd", "s"),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn empty_secret_is_invalid() {
        assert_eq!(sign(b"x", ""), Err(SignatureError::InvalidSecret));
    }

    #[test]
    fn known_vector() {
        // RFC 4231 test case 2
        let header = sign(b"what do ya want for nothing?", "Jefe").unwrap();
        assert_eq!(
            header,
            "sha256=5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn token_comparison() {
        assert!(tokens_match("secret-token", "secret-token"));
        assert!(!tokens_match("secret-token", "secret-tokem"));
        assert!(!tokens_match("short", "longer-token"));
    }
}
