//! Ledger Model
//!
//! UTXO-style records, transactions and the collaborators that store and
//! notarise them.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  party.rs        - Parties, ed25519 keys, signatures         │
//! │  states.rs       - Token / Commitment / Revealed / Game /    │
//! │                    Leaderboard records                       │
//! │  transaction.rs  - Commands, time windows, builder, ids      │
//! │  store.rs        - Store + notary traits, in-memory ledger   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod party;
pub mod states;
pub mod store;
pub mod transaction;

pub use party::{KeyPair, Party, PublicKey, TransactionSignature};
pub use states::{
    CommitImage, CommitmentState, ContractState, GamePointer, GameState, LeaderboardEntry,
    RevealedState, StateAndRef, StateRef, TokenState,
};
pub use store::{InMemoryLedger, LedgerStore, Notary, NotaryError};
pub use transaction::{
    Command, CommandWithSigners, CommitCommand, LeaderboardCommand, LedgerTransaction,
    SignedTransaction, TimeWindow, TokenCommand, TransactionBuilder, WireTransaction,
};

use crate::contracts::ContractError;

/// Errors raised while building, resolving or checking transactions.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Transaction body could not be encoded.
    #[error("serialization failed: {0}")]
    Serialization(#[from] bincode::Error),

    /// Input or reference not found among unspent records.
    #[error("unknown or consumed state {0}")]
    UnknownState(StateRef),

    /// The same record is consumed twice by one transaction.
    #[error("state {0} consumed twice in one transaction")]
    DuplicateInput(StateRef),

    /// A signature does not verify over the transaction id.
    #[error("invalid signature by {0:?}")]
    InvalidSignature(PublicKey),

    /// Required signers that have not signed.
    #[error("missing signatures from {0:?}")]
    MissingSignatures(Vec<PublicKey>),

    /// A contract rejected the transaction.
    #[error(transparent)]
    Contract(#[from] ContractError),
}
