//! Payout Derivation
//!
//! Maps a set of revealed images to a payout. Pure and order-independent:
//! any party holding the revealed records can recompute the result.
//!
//! ```text
//! images ──encode──► sort ──concat──► SHA-256 ──clear top bit──► mod M ──► bucket walk
//! ```
//!
//! The digest is reduced with a plain modulo, so indices are not exactly
//! uniform (2^255 is not a multiple of M). The skew is below 2^-240 for
//! any practical modulus.

use serde::{Deserialize, Serialize};

use crate::core::hash::{DigestBuilder, PAYOUT_DOMAIN};
use crate::ledger::states::CommitImage;

/// Modulus of the default table.
pub const DEFAULT_MODULUS: u64 = 10_000;

/// Errors from payout derivation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayoutError {
    /// Fewer than two images were supplied.
    #[error("payout needs at least two revealed images, got {0}")]
    NotEnoughImages(usize),

    /// Table modulus is zero.
    #[error("payout table modulus must be positive")]
    ZeroModulus,
}

/// One bucket: indices `[start, start + width)` pay `payout`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    /// Number of indices covered.
    pub width: u64,
    /// Credits paid for a hit.
    pub payout: u64,
}

/// Ordered bucket table over `[0, modulus)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutTable {
    /// Range of the derived index.
    pub modulus: u64,
    /// Buckets walked in order. Indices past the last bucket pay nothing.
    pub buckets: Vec<Bucket>,
}

impl Default for PayoutTable {
    fn default() -> Self {
        let buckets = [(1, 400), (10, 100), (40, 50), (150, 15), (400, 5), (1400, 2), (2000, 1)]
            .into_iter()
            .map(|(width, payout)| Bucket { width, payout })
            .collect();
        Self { modulus: DEFAULT_MODULUS, buckets }
    }
}

impl PayoutTable {
    /// Create a table.
    pub fn new(modulus: u64, buckets: Vec<Bucket>) -> Self {
        Self { modulus, buckets }
    }

    /// Largest payout any index can produce. This is what the house stakes.
    pub fn max_payout(&self) -> u64 {
        self.buckets.iter().map(|b| b.payout).max().unwrap_or(0)
    }

    /// Payout for a derived index.
    pub fn payout_for_index(&self, index: u64) -> u64 {
        let mut remaining = index;
        for bucket in &self.buckets {
            if remaining < bucket.width {
                return bucket.payout;
            }
            remaining -= bucket.width;
        }
        0
    }

    /// Expected payout per game, in credits.
    pub fn expected_payout(&self) -> f64 {
        if self.modulus == 0 {
            return 0.0;
        }
        let mut covered = 0u64;
        let mut total = 0f64;
        for bucket in &self.buckets {
            let width = bucket.width.min(self.modulus.saturating_sub(covered));
            total += width as f64 * bucket.payout as f64;
            covered += width;
        }
        total / self.modulus as f64
    }
}

/// Uniform-ish index in `[0, modulus)` derived from the images.
pub fn derive_index(images: &[CommitImage], modulus: u64) -> Result<u64, PayoutError> {
    if images.len() < 2 {
        return Err(PayoutError::NotEnoughImages(images.len()));
    }
    if modulus == 0 {
        return Err(PayoutError::ZeroModulus);
    }

    let mut encoded: Vec<[u8; 16]> = images.iter().map(CommitImage::encode).collect();
    encoded.sort_unstable();

    let mut builder = DigestBuilder::new(PAYOUT_DOMAIN);
    for bytes in &encoded {
        builder.update_bytes(bytes);
    }
    let mut digest = builder.finalize().0;
    digest[0] &= 0x7F;

    // Big-endian reduction, one byte at a time.
    let m = u128::from(modulus);
    let index = digest
        .iter()
        .fold(0u128, |acc, b| (acc * 256 + u128::from(*b)) % m);
    Ok(index as u64)
}

/// Payout the images win against `table`.
pub fn derive_payout(images: &[CommitImage], table: &PayoutTable) -> Result<u64, PayoutError> {
    let index = derive_index(images, table.modulus)?;
    Ok(table.payout_for_index(index))
}
