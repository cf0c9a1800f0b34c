//! Game Logic
//!
//! Payout derivation from revealed images. Pure and deterministic: every
//! party, and any later observer, computes the same payout from the same
//! images.

pub mod payout;

pub use payout::{derive_index, derive_payout, Bucket, PayoutError, PayoutTable, DEFAULT_MODULUS};
