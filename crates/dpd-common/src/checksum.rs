//! Checksum utilities for integrity verification

use crate::error::{DpdError, Result};
use sha2::{Digest, Sha256};

/// SHA-256 of an in-memory buffer, hex encoded
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Verify that `bytes` hash to `expected`
pub fn verify_digest(bytes: &[u8], expected: &str) -> Result<()> {
    let actual = sha256_hex(bytes);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(DpdError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const HELLO_SHA256: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_sha256_hex() {
        assert_eq!(sha256_hex(b"hello world"), HELLO_SHA256);
    }

    #[test]
    fn test_verify_digest_accepts_either_case() {
        verify_digest(b"hello world", HELLO_SHA256).unwrap();
        verify_digest(b"hello world", &HELLO_SHA256.to_uppercase()).unwrap();
    }

    #[test]
    fn test_verify_digest_mismatch() {
        let err = verify_digest(b"hello there", HELLO_SHA256).unwrap_err();
        match err {
            DpdError::ChecksumMismatch { expected, actual } => {
                assert_eq!(expected, HELLO_SHA256);
                assert_eq!(actual, sha256_hex(b"hello there"));
            },
        }
    }
}
