//! HMAC helpers shared by the webhook verifiers

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{PaymentError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded HMAC-SHA256 of `message` under `key`
pub(crate) fn hmac_sha256_hex(key: &[u8], message: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| PaymentError::Config("invalid webhook secret".into()))?;
    mac.update(message);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time comparison of two hex signatures
///
/// Length is not secret (always 64 hex chars for SHA-256).
pub(crate) fn signatures_match(expected: &str, provided: &str) -> bool {
    let expected = expected.as_bytes();
    let provided = provided.trim().to_ascii_lowercase();
    let provided = provided.as_bytes();

    if expected.len() != provided.len() {
        return false;
    }
    expected.ct_eq(provided).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_hmac_vector() {
        // RFC 4231 test case 2
        let sig = hmac_sha256_hex(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            sig,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_signatures_match() {
        let sig = hmac_sha256_hex(b"salt", b"payload").unwrap();
        assert!(signatures_match(&sig, &sig));
        assert!(signatures_match(&sig, &sig.to_uppercase()));
        assert!(!signatures_match(&sig, &sig[..63]));
        assert!(!signatures_match(&sig, "00"));
    }
}
