//! HMAC-SHA256 webhook signature verification.
//!
//! Every inbound webhook is verified before any parsing, persistence, or
//! queue write. The comparison runs in constant time (`Mac::verify_slice`),
//! so response timing leaks nothing about how many leading digest bytes
//! matched.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Disjoint rejection reasons. Each maps to a 403 at the boundary; none of
/// them ever reaches downstream components.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing signature header")]
    MissingHeader,
    #[error("malformed signature header, expected sha256= prefix")]
    MalformedPrefix,
    #[error("signature mismatch")]
    Mismatch,
}

/// Verify a `sha256=<hex>` signature header against the raw request body.
pub fn verify_signature(
    header_value: Option<&str>,
    body: &[u8],
    secret: &str,
) -> Result<(), SignatureError> {
    let header = header_value.ok_or(SignatureError::MissingHeader)?;

    let signature_hex = header
        .strip_prefix("sha256=")
        .ok_or(SignatureError::MalformedPrefix)?;

    let signature = hex::decode(signature_hex).map_err(|_| SignatureError::MalformedPrefix)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| SignatureError::Mismatch)?;
    mac.update(body);

    mac.verify_slice(&signature)
        .map_err(|_| SignatureError::Mismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test_webhook_secret_1234567890abcdef";

    fn sign(body: &[u8], secret: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_is_accepted() {
        let body = br#"{"action":"opened"}"#;
        let header = sign(body, SECRET);
        assert_eq!(verify_signature(Some(&header), body, SECRET), Ok(()));
    }

    #[test]
    fn missing_header_is_rejected() {
        assert_eq!(
            verify_signature(None, b"{}", SECRET),
            Err(SignatureError::MissingHeader)
        );
    }

    #[test]
    fn wrong_prefix_is_rejected() {
        assert_eq!(
            verify_signature(Some("md5=notavalidformat"), b"{}", SECRET),
            Err(SignatureError::MalformedPrefix)
        );
    }

    #[test]
    fn non_hex_digest_is_rejected_as_malformed() {
        assert_eq!(
            verify_signature(Some("sha256=zzzz"), b"{}", SECRET),
            Err(SignatureError::MalformedPrefix)
        );
    }

    #[test]
    fn wrong_digest_is_rejected() {
        let header = format!("sha256={}", "0".repeat(64));
        assert_eq!(
            verify_signature(Some(&header), b"{}", SECRET),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn flipped_final_byte_is_rejected() {
        let body = br#"{"action":"opened"}"#;
        let mut header = sign(body, SECRET);
        let last = header.pop().unwrap();
        header.push(if last == '0' { '1' } else { '0' });
        assert_eq!(
            verify_signature(Some(&header), body, SECRET),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn tampered_body_is_rejected() {
        let original = br#"{"action":"opened"}"#;
        let header = sign(original, SECRET);
        let tampered = br#"{"action":"closed"}"#;
        assert_eq!(
            verify_signature(Some(&header), tampered, SECRET),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let body = b"payload";
        let header = sign(body, "other-secret");
        assert_eq!(
            verify_signature(Some(&header), body, SECRET),
            Err(SignatureError::Mismatch)
        );
    }
}
