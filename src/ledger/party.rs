//! Parties and Signatures
//!
//! A party is a display name bound to an ed25519 key. Transactions are
//! signed over their id; signers are identified by public key only.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::core::hash::SecureHash;
use crate::core::rng::SecretSource;

/// Raw ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    /// Short prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.short())
    }
}

/// A well-known participant.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Party {
    /// Human-readable name, also the identity handle.
    pub name: String,
    /// Key that signs on this party's behalf.
    pub owning_key: PublicKey,
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.owning_key.short())
    }
}

/// Signature over a transaction id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSignature {
    /// Signing key.
    pub by: PublicKey,
    /// 64-byte ed25519 signature.
    pub bytes: Vec<u8>,
}

impl TransactionSignature {
    /// Check the signature against a transaction id.
    pub fn verify(&self, tx_id: &SecureHash) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.by.0) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&self.bytes) else {
            return false;
        };
        key.verify(tx_id.as_bytes(), &signature).is_ok()
    }
}

/// A party together with its private signing key.
pub struct KeyPair {
    signing_key: SigningKey,
    party: Party,
}

impl KeyPair {
    /// Generate a fresh key for `name`.
    pub fn generate(name: impl Into<String>, source: &dyn SecretSource) -> Self {
        let mut seed = [0u8; 32];
        source.fill_bytes(&mut seed);
        let signing_key = SigningKey::from_bytes(&seed);
        let party = Party {
            name: name.into(),
            owning_key: PublicKey(signing_key.verifying_key().to_bytes()),
        };
        Self { signing_key, party }
    }

    /// Public identity.
    pub fn party(&self) -> &Party {
        &self.party
    }

    /// Public key.
    pub fn public_key(&self) -> PublicKey {
        self.party.owning_key
    }

    /// Sign a transaction id.
    pub fn sign(&self, tx_id: &SecureHash) -> TransactionSignature {
        let signature = self.signing_key.sign(tx_id.as_bytes());
        TransactionSignature {
            by: self.public_key(),
            bytes: signature.to_bytes().to_vec(),
        }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair").field("party", &self.party).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash::{hash_with_domain, TX_DOMAIN};
    use crate::core::rng::SeededSecretSource;

    #[test]
    fn test_sign_and_verify() {
        let keys = KeyPair::generate("alice", &SeededSecretSource::new(1));
        let id = hash_with_domain(TX_DOMAIN, b"tx");
        let sig = keys.sign(&id);

        assert_eq!(sig.by, keys.public_key());
        assert!(sig.verify(&id));
        assert!(!sig.verify(&hash_with_domain(TX_DOMAIN, b"other")));
    }

    #[test]
    fn test_forged_signer_fails() {
        let source = SeededSecretSource::new(2);
        let alice = KeyPair::generate("alice", &source);
        let bob = KeyPair::generate("bob", &source);
        let id = hash_with_domain(TX_DOMAIN, b"tx");

        let mut sig = alice.sign(&id);
        sig.by = bob.public_key();
        assert!(!sig.verify(&id));
    }

    #[test]
    fn test_truncated_signature_fails() {
        let keys = KeyPair::generate("alice", &SeededSecretSource::new(3));
        let id = hash_with_domain(TX_DOMAIN, b"tx");
        let mut sig = keys.sign(&id);
        sig.bytes.truncate(10);
        assert!(!sig.verify(&id));
    }
}
