//! Contract Verification
//!
//! Pure, deterministic rules deciding whether a transaction is acceptable.
//! One contract per record family; each sees the whole resolved
//! transaction and checks only its own records and commands.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  token.rs        - Issue / Lock / Release / Redeem           │
//! │  commit.rs       - Commit / Reveal / Use / Resolve / Close   │
//! │  leaderboard.rs  - Create / Overtake / Retire                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every family also enforces index hygiene: each of its records in the
//! inputs and outputs is claimed by exactly one command, and no two
//! commands claim the same index.

pub mod commit;
pub mod leaderboard;
pub mod token;

use std::collections::BTreeSet;

use tracing::debug;

use crate::ledger::party::{Party, PublicKey};
use crate::ledger::states::ContractState;
use crate::ledger::transaction::LedgerTransaction;

pub use commit::CommitContract;
pub use leaderboard::{LeaderboardContract, LEADERBOARD_TIME_RADIUS_SECS};
pub use token::TokenContract;

/// A contract rejected a transaction.
///
/// The reason is deterministic: any observer re-running verification gets
/// the same text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractError {
    /// Token family rejection.
    #[error("token contract: {0}")]
    Token(String),

    /// Commit/reveal family rejection.
    #[error("commit contract: {0}")]
    Commit(String),

    /// Leaderboard family rejection.
    #[error("leaderboard contract: {0}")]
    Leaderboard(String),
}

impl ContractError {
    /// Human-readable reason without the family prefix.
    pub fn reason(&self) -> &str {
        match self {
            Self::Token(r) | Self::Commit(r) | Self::Leaderboard(r) => r,
        }
    }
}

/// Validation rules for one record family.
pub trait Contract {
    /// Accept the transaction or explain the rejection.
    fn verify(&self, tx: &LedgerTransaction) -> Result<(), ContractError>;
}

/// Run every family's contract.
pub fn verify_transaction(tx: &LedgerTransaction) -> Result<(), ContractError> {
    let result = TokenContract
        .verify(tx)
        .and_then(|_| CommitContract.verify(tx))
        .and_then(|_| LeaderboardContract.verify(tx));

    if let Err(e) = &result {
        debug!(tx = %tx.id.short(), reason = %e, "contract rejected transaction");
    }
    result
}

/// Fail with `reason` unless `condition` holds.
pub(crate) fn require(condition: bool, reason: impl Into<String>) -> Result<(), String> {
    if condition {
        Ok(())
    } else {
        Err(reason.into())
    }
}

/// `party`'s key is among `signers`.
pub(crate) fn signed_by(signers: &[PublicKey], party: &Party) -> bool {
    signers.contains(&party.owning_key)
}

/// Index claims made by one family's commands.
#[derive(Debug, Default)]
pub(crate) struct IndexClaims {
    inputs: BTreeSet<usize>,
    outputs: BTreeSet<usize>,
}

impl IndexClaims {
    /// Claim an input index for one command.
    pub fn claim_input(&mut self, tx: &LedgerTransaction, index: usize) -> Result<(), String> {
        require(index < tx.inputs.len(), format!("input index {} out of range", index))?;
        require(
            self.inputs.insert(index),
            format!("input {} claimed by more than one command", index),
        )
    }

    /// Claim an output index for one command.
    pub fn claim_output(&mut self, tx: &LedgerTransaction, index: usize) -> Result<(), String> {
        require(index < tx.outputs.len(), format!("output index {} out of range", index))?;
        require(
            self.outputs.insert(index),
            format!("output {} claimed by more than one command", index),
        )
    }

    /// Claim several input indices.
    pub fn claim_inputs(&mut self, tx: &LedgerTransaction, indices: &[usize]) -> Result<(), String> {
        indices.iter().try_for_each(|i| self.claim_input(tx, *i))
    }

    /// Claim several output indices.
    pub fn claim_outputs(&mut self, tx: &LedgerTransaction, indices: &[usize]) -> Result<(), String> {
        indices.iter().try_for_each(|i| self.claim_output(tx, *i))
    }

    /// Every family record in the transaction is claimed.
    pub fn check_coverage<F>(&self, tx: &LedgerTransaction, in_family: F) -> Result<(), String>
    where
        F: Fn(&ContractState) -> bool,
    {
        for (i, input) in tx.inputs.iter().enumerate() {
            if in_family(&input.state) {
                require(self.inputs.contains(&i), format!("input {} is not covered by any command", i))?;
            }
        }
        for (i, output) in tx.outputs.iter().enumerate() {
            if in_family(output) {
                require(self.outputs.contains(&i), format!("output {} is not covered by any command", i))?;
            }
        }
        Ok(())
    }
}
