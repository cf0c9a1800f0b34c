//! Core primitives.
//!
//! Hashing, secret randomness and ledger time shared by contracts and flows.

pub mod clock;
pub mod hash;
pub mod rng;

pub use clock::{Clock, ManualClock, SystemClock};
pub use hash::{hash_with_domain, DigestBuilder, SecureHash};
pub use rng::{OsSecretSource, SecretSource, SeededSecretSource};
