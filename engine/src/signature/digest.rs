//! Content digests
//!
//! SHA-256 and BLAKE3 checksums.
//!
//! Expected digests are written as `"sha256:<hex>"` or `"blake3:<hex>"`;
//! a bare hex string is treated as SHA-256.

use sdk::errors::EngineError;
use sha2::{Digest, Sha256};

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha256,
    Blake3,
}

/// Compute the SHA-256 hash of `data` and return hex string
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Raw SHA-256 digest of `data`
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute the BLAKE3 hash of `data` and return hex string
pub fn blake3_hex(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Split an expected checksum into its algorithm and lowercase hex digest
pub fn parse_checksum(expected: &str) -> Result<(DigestAlgorithm, String), EngineError> {
    let (algorithm, hex_part) = if let Some(hex) = expected.strip_prefix("sha256:") {
        (DigestAlgorithm::Sha256, hex)
    } else if let Some(hex) = expected.strip_prefix("blake3:") {
        (DigestAlgorithm::Blake3, hex)
    } else if !expected.contains(':') {
        (DigestAlgorithm::Sha256, expected)
    } else {
        return Err(EngineError::Config(format!(
            "Invalid checksum format: expected 'sha256:hex' or 'blake3:hex', got '{}'",
            expected
        )));
    };

    if hex_part.len() != 64 || hex::decode(hex_part).is_err() {
        return Err(EngineError::Config(format!(
            "Invalid checksum digest '{}': expected 64 hex characters",
            hex_part
        )));
    }

    Ok((algorithm, hex_part.to_ascii_lowercase()))
}

/// Compute the digest of `data` with the given algorithm
pub fn compute(algorithm: DigestAlgorithm, data: &[u8]) -> String {
    match algorithm {
        DigestAlgorithm::Sha256 => sha256_hex(data),
        DigestAlgorithm::Blake3 => blake3_hex(data),
    }
}

/// Verify that the digest of `data` matches `expected`
///
/// # Errors
///
/// Returns `EngineError::ChecksumMismatch` carrying both digests on mismatch.
pub fn verify_checksum(data: &[u8], expected: &str) -> Result<(), EngineError> {
    let (algorithm, expected_hex) = parse_checksum(expected)?;
    let computed = compute(algorithm, data);

    if computed != expected_hex {
        return Err(EngineError::ChecksumMismatch {
            expected: expected_hex,
            actual: computed,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_and_verify_hash() {
        let data = b"hello world";
        let hash = sha256_hex(data);
        assert!(verify_checksum(data, &hash).is_ok());
        assert!(verify_checksum(data, &format!("sha256:{}", hash)).is_ok());
        assert!(verify_checksum(data, &format!("blake3:{}", blake3_hex(data))).is_ok());
    }

    #[test]
    fn test_verify_hash_mismatch() {
        let data = b"hello world";
        let result = verify_checksum(data, &"0".repeat(64));
        assert!(matches!(result, Err(EngineError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_uppercase_digest_accepted() {
        let data = b"case";
        let upper = sha256_hex(data).to_ascii_uppercase();
        assert!(verify_checksum(data, &upper).is_ok());
    }

    #[test]
    fn test_unknown_prefix_rejected() {
        assert!(parse_checksum("md5:abcd").is_err());
        assert!(parse_checksum("sha256:abcd").is_err());
    }
}
