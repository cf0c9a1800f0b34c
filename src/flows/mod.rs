//! Protocol Flows
//!
//! Multi-step exchanges that build, check, sign and notarise transactions
//! between parties. Each role is an explicit state machine; its stage is
//! checkpointed after every send and receive so a restarted node can pick
//! the flow up where it stopped.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  config.rs       - Reveal window, retries, paytable          │
//! │  checkpoint.rs   - Resume points and their store             │
//! │  node.rs         - One party's services and entry points     │
//! │  tokens.rs       - Issue / redeem                            │
//! │  play.rs         - Player and casino roles, close recovery   │
//! │  leaderboard.rs  - Create / overtake / retire                │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod checkpoint;
pub mod config;
pub mod leaderboard;
pub mod node;
pub mod play;
pub mod tokens;

pub use checkpoint::{CasinoStage, Checkpoint, CheckpointStore, CommittedGame, InMemoryCheckpoints, PlayerStage};
pub use config::FlowConfig;
pub use node::{Node, NodeServices};
pub use play::{CasinoFlow, GameOutcome, PlayerFlow};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::game::payout::PayoutError;
use crate::ledger::store::NotaryError;
use crate::ledger::LedgerError;
use crate::network::session::SessionError;

/// Why a flow stopped.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// Building or checking a transaction failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// The notary refused the transaction.
    #[error("notarisation failed: {0}")]
    Notary(#[from] NotaryError),

    /// The session broke or carried something unexpected.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Revealed images could not produce a payout.
    #[error(transparent)]
    Payout(#[from] PayoutError),

    /// The counterparty refused to continue.
    #[error("counterparty rejected: {0}")]
    CounterpartyRejected(String),

    /// No peer is registered under the handle.
    #[error("identity not found: {0}")]
    IdentityNotFound(String),

    /// Not enough spendable tokens.
    #[error("insufficient funds: needed {needed}, available {available}")]
    InsufficientFunds {
        /// Amount requested.
        needed: u64,
        /// Unreserved spendable amount.
        available: u64,
    },

    /// A counterparty proposal failed local checks.
    #[error("invalid proposal: {0}")]
    InvalidProposal(String),

    /// The caller asked for something that cannot be done.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The game is not on the ledger, or not ours.
    #[error("unknown game {0}")]
    UnknownGame(Uuid),

    /// Close attempted while reveals are still accepted.
    #[error("reveal deadline {0} has not passed")]
    DeadlineNotReached(DateTime<Utc>),

    /// Notary conflicts persisted past the retry budget.
    #[error("gave up after {0} notary conflicts")]
    RetriesExhausted(u32),

    /// A checkpoint could not be stored or read back.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
}

impl FlowError {
    /// Notary conflicts are retried with fresh inputs.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Notary(e) if e.is_conflict())
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(e: serde_json::Error) -> Self {
        Self::Checkpoint(e.to_string())
    }
}

/// Fail with a proposal error unless `condition` holds.
pub(crate) fn ensure(condition: bool, reason: &str) -> Result<(), FlowError> {
    if condition {
        Ok(())
    } else {
        Err(FlowError::InvalidProposal(reason.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod testing;
