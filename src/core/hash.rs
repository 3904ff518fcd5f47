// Hashing utilities for blocks and Merkle signatures

use sha2::{Digest, Sha256, Sha512};
use std::sync::Arc;

/// Digest used by the proof-of-work search
///
/// Implementations must be deterministic and return at least one byte.
pub trait BlockDigest: Send + Sync {
    /// Name the digest was selected by
    fn name(&self) -> &'static str;

    /// Digest length in bytes
    fn output_len(&self) -> usize;

    fn digest(&self, data: &[u8]) -> Vec<u8>;
}

/// SHA-256 block digest (default)
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Digest;

impl BlockDigest for Sha256Digest {
    fn name(&self) -> &'static str {
        "sha256"
    }

    fn output_len(&self) -> usize {
        32
    }

    fn digest(&self, data: &[u8]) -> Vec<u8> {
        Sha256::digest(data).to_vec()
    }
}

/// SHA-512 block digest
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha512Digest;

impl BlockDigest for Sha512Digest {
    fn name(&self) -> &'static str {
        "sha512"
    }

    fn output_len(&self) -> usize {
        64
    }

    fn digest(&self, data: &[u8]) -> Vec<u8> {
        Sha512::digest(data).to_vec()
    }
}

/// Look up a block digest by its configured name
///
/// Returns `None` when the primitive is not available in this build.
pub fn digest_by_name(name: &str) -> Option<Arc<dyn BlockDigest>> {
    match name.to_ascii_lowercase().as_str() {
        "sha256" | "sha-256" => Some(Arc::new(Sha256Digest)),
        "sha512" | "sha-512" => Some(Arc::new(Sha512Digest)),
        _ => None,
    }
}

/// Hex-encoded SHA-256 of a string
pub fn sha256_hex(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}

/// SHA256 applied twice, each pass over the previous pass's hex text
/// signature = hex(SHA256(hex(SHA256(data))))
pub fn double_sha256_hex(data: &str) -> String {
    sha256_hex(&sha256_hex(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_double_sha256_hex() {
        let once = sha256_hex("hello world");
        let twice = double_sha256_hex("hello world");
        assert_eq!(twice, sha256_hex(&once));
        assert_ne!(once, twice);
        assert_eq!(twice.len(), 64);
    }

    #[test]
    fn test_digest_by_name() {
        let sha256 = digest_by_name("sha256").unwrap();
        assert_eq!(sha256.digest(b"data").len(), 32);
        assert_eq!(sha256.output_len(), 32);

        let sha512 = digest_by_name("SHA-512").unwrap();
        assert_eq!(sha512.digest(b"data").len(), 64);
        assert_eq!(sha512.name(), "sha512");

        assert!(digest_by_name("md5").is_none());
    }
}
