//! Secure Hashing
//!
//! SHA-256 digests used for:
//! - Commitment hashes over secret images
//! - Payout derivation over revealed images
//! - Transaction identifiers

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Domain separator for commitment hashes.
pub const COMMIT_DOMAIN: &[u8] = b"FAIR_SLOTS_COMMIT_V1";

/// Domain separator for payout derivation.
pub const PAYOUT_DOMAIN: &[u8] = b"FAIR_SLOTS_PAYOUT_V1";

/// Domain separator for transaction ids.
pub const TX_DOMAIN: &[u8] = b"FAIR_SLOTS_TX_V1";

/// 256-bit digest.
///
/// Ordered byte-wise so it can key `BTreeMap`s deterministically.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SecureHash(pub [u8; 32]);

impl SecureHash {
    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for SecureHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for SecureHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureHash({})", self.short())
    }
}

/// Domain-separated SHA-256 builder.
///
/// Order of updates is part of the digest; callers fix it.
pub struct DigestBuilder {
    hasher: Sha256,
}

impl DigestBuilder {
    /// Create a new builder with a domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Update with raw bytes.
    #[inline]
    pub fn update_bytes(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Finalize and return the digest.
    pub fn finalize(self) -> SecureHash {
        SecureHash(self.hasher.finalize().into())
    }
}

/// Hash with domain separator.
pub fn hash_with_domain(domain: &[u8], data: &[u8]) -> SecureHash {
    let mut builder = DigestBuilder::new(domain);
    builder.update_bytes(data);
    builder.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_determinism() {
        let make = || {
            let mut b = DigestBuilder::new(b"test");
            b.update_bytes(&7u64.to_be_bytes());
            b.update_bytes(&(-3i64).to_be_bytes());
            b.finalize()
        };
        assert_eq!(make(), make());
    }

    #[test]
    fn test_update_order_matters() {
        let mut a = DigestBuilder::new(b"test");
        a.update_bytes(b"one");
        a.update_bytes(b"two");

        let mut b = DigestBuilder::new(b"test");
        b.update_bytes(b"two");
        b.update_bytes(b"one");

        assert_ne!(a.finalize(), b.finalize());
    }

    #[test]
    fn test_domain_separation() {
        let data = [1u8, 2, 3, 4];
        assert_ne!(
            hash_with_domain(COMMIT_DOMAIN, &data),
            hash_with_domain(PAYOUT_DOMAIN, &data)
        );
    }

    #[test]
    fn test_display_is_full_hex() {
        let h = hash_with_domain(TX_DOMAIN, b"abc");
        let text = h.to_string();
        assert_eq!(text.len(), 64);
        assert!(text.starts_with(&h.short()));
    }
}
