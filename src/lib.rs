//! # Fair Slots
//!
//! A two-party slot machine settled on a UTXO ledger. Player and casino
//! each commit to a secret image, lock wager and stake into a joint pot,
//! reveal, and derive the payout from both images. Neither side can bias
//! the result, and a side that stops cooperating forfeits its stake.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        FAIR SLOTS                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Primitives                                │
//! │  ├── hash.rs     - Domain-separated SHA-256                  │
//! │  ├── rng.rs      - Secret sources (OS / seeded StdRng)       │
//! │  └── clock.rs    - Ledger time                               │
//! │                                                              │
//! │  ledger/         - Records and transactions                  │
//! │  contracts/      - Token, commit/reveal, leaderboard rules   │
//! │  game/           - Payout derivation (deterministic)         │
//! │                                                              │
//! │  network/        - Sessions and peer directory               │
//! │  flows/          - Issue, redeem, play, close, leaderboard   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Determinism Guarantee
//!
//! `contracts/` and `game/` are pure functions of a transaction or a set of
//! images: no clocks, no randomness, no I/O. Time reaches contracts only
//! through a transaction's time window, checked by the notary.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod contracts;
pub mod core;
pub mod flows;
pub mod game;
pub mod ledger;
pub mod network;

// Re-export commonly used types
pub use crate::core::hash::SecureHash;
pub use flows::{FlowConfig, FlowError, GameOutcome, Node, NodeServices};
pub use game::payout::{derive_payout, PayoutTable};
pub use ledger::{InMemoryLedger, Party, StateRef};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
