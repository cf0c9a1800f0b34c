//! Secret Sources
//!
//! Randomness for secret images and signing keys.
//!
//! Production nodes draw from the operating system. Demos and tests can
//! swap in a seeded source so a whole protocol run replays bit-for-bit.

use std::sync::Mutex;

use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};

/// Source of secret randomness for a node.
pub trait SecretSource: Send + Sync {
    /// Next random 64-bit value.
    fn next_u64(&self) -> u64;

    /// Fill a buffer with random bytes.
    fn fill_bytes(&self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let bytes = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    /// Next random signed 64-bit value.
    fn next_i64(&self) -> i64 {
        self.next_u64() as i64
    }
}

/// Operating-system backed source.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsSecretSource;

impl SecretSource for OsSecretSource {
    fn next_u64(&self) -> u64 {
        OsRng.next_u64()
    }

    fn fill_bytes(&self, dest: &mut [u8]) {
        OsRng.fill_bytes(dest);
    }
}

/// Seeded source shared across tasks.
///
/// Anyone who learns the seed learns every secret drawn from it; keep it
/// to demos and tests.
#[derive(Debug)]
pub struct SeededSecretSource {
    rng: Mutex<StdRng>,
}

impl SeededSecretSource {
    /// Create from a seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut rng)
    }
}

impl SecretSource for SeededSecretSource {
    fn next_u64(&self) -> u64 {
        self.with_rng(|rng| rng.next_u64())
    }

    fn fill_bytes(&self, dest: &mut [u8]) {
        self.with_rng(|rng| rng.fill_bytes(dest));
    }
}
