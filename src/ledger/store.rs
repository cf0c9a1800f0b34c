//! Ledger Collaborators
//!
//! The protocol consumes two capabilities it does not implement itself:
//! a store that resolves and lists records, and a notary that accepts a
//! transaction and marks its inputs consumed exactly once.
//!
//! [`InMemoryLedger`] provides both for a single process.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::core::clock::Clock;
use crate::core::hash::SecureHash;
use crate::ledger::party::Party;
use crate::ledger::states::{ContractState, LeaderboardEntry, StateAndRef, StateRef};
use crate::ledger::transaction::{LedgerTransaction, SignedTransaction, WireTransaction};
use crate::ledger::LedgerError;

/// Notarisation failures.
#[derive(Debug, thiserror::Error)]
pub enum NotaryError {
    /// An input or reference was already consumed by another transaction.
    #[error("state {state} already consumed")]
    Conflict {
        /// The contested record.
        state: StateRef,
    },

    /// The notary's clock is outside the transaction's time window.
    #[error("time window does not contain notary time {now}")]
    OutsideTimeWindow {
        /// Notary time at submission.
        now: DateTime<Utc>,
    },

    /// The transaction itself is invalid.
    #[error("invalid transaction: {0}")]
    Invalid(#[from] LedgerError),
}

impl NotaryError {
    /// Conflicts are retried with fresh inputs; everything else is final.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Uniqueness service.
#[async_trait]
pub trait Notary: Send + Sync {
    /// Accept `stx` and consume its inputs, or explain why not.
    async fn submit(&self, stx: &SignedTransaction) -> Result<SecureHash, NotaryError>;
}

/// Record storage and lookup.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Unspent record at `state_ref`.
    async fn resolve_state(&self, state_ref: &StateRef) -> Option<ContractState>;

    /// Every unspent record.
    async fn unspent_states(&self) -> Vec<StateAndRef>;

    /// Committed transaction by id.
    async fn transaction(&self, id: &SecureHash) -> Option<SignedTransaction>;

    /// Record at `state_ref`, consumed or not.
    async fn historic_state(&self, state_ref: &StateRef) -> Option<ContractState> {
        self.transaction(&state_ref.txhash)
            .await
            .and_then(|stx| stx.tx.outputs.get(state_ref.index as usize).cloned())
    }

    /// Unlocked tokens held by `holder` from `issuer`.
    async fn spendable_tokens(&self, holder: &Party, issuer: &Party) -> Vec<StateAndRef> {
        self.unspent_states()
            .await
            .into_iter()
            .filter(|s| {
                s.state
                    .as_token()
                    .is_some_and(|t| t.is_spendable_by(holder, issuer))
            })
            .collect()
    }

    /// Sum of [`LedgerStore::spendable_tokens`].
    async fn balance(&self, holder: &Party, issuer: &Party) -> u64 {
        self.spendable_tokens(holder, issuer)
            .await
            .iter()
            .filter_map(|s| s.state.as_token())
            .map(|t| t.amount)
            .sum()
    }

    /// Unspent leaderboard entries, highest total first.
    async fn leaderboard(&self) -> Vec<(StateRef, LeaderboardEntry)> {
        let mut entries: Vec<(StateRef, LeaderboardEntry)> = self
            .unspent_states()
            .await
            .into_iter()
            .filter_map(|s| s.state.as_leaderboard().cloned().map(|e| (s.state_ref, e)))
            .collect();
        entries.sort_by(|a, b| b.1.total.cmp(&a.1.total).then(a.1.creation.cmp(&b.1.creation)));
        entries
    }
}

/// Resolve a wire transaction through a store.
pub async fn resolve_transaction(
    store: &dyn LedgerStore,
    tx: &WireTransaction,
) -> Result<LedgerTransaction, LedgerError> {
    let mut found = BTreeMap::new();
    for r in tx.inputs.iter().chain(tx.references.iter()) {
        if let Some(state) = store.resolve_state(r).await {
            found.insert(*r, state);
        }
    }
    tx.resolve(|r| found.get(r).cloned())
}

#[derive(Default)]
struct LedgerInner {
    unspent: BTreeMap<StateRef, ContractState>,
    consumed: BTreeMap<StateRef, SecureHash>,
    transactions: BTreeMap<SecureHash, SignedTransaction>,
}

/// Single-process ledger acting as store and notary.
pub struct InMemoryLedger {
    inner: RwLock<LedgerInner>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLedger {
    /// Empty ledger using `clock` for time-window checks.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: RwLock::new(LedgerInner::default()),
            clock,
        }
    }

    /// Transaction that consumed `state_ref`, if any.
    pub async fn consumed_by(&self, state_ref: &StateRef) -> Option<SecureHash> {
        self.inner.read().await.consumed.get(state_ref).copied()
    }

    /// Number of committed transactions.
    pub async fn transaction_count(&self) -> usize {
        self.inner.read().await.transactions.len()
    }
}

#[async_trait]
impl Notary for InMemoryLedger {
    async fn submit(&self, stx: &SignedTransaction) -> Result<SecureHash, NotaryError> {
        let id = stx.id()?;
        let mut inner = self.inner.write().await;

        if inner.transactions.contains_key(&id) {
            debug!(tx = %id.short(), "resubmission of committed transaction");
            return Ok(id);
        }

        let mut seen = BTreeSet::new();
        for r in &stx.tx.inputs {
            if !seen.insert(*r) {
                return Err(LedgerError::DuplicateInput(*r).into());
            }
        }

        for r in stx.tx.inputs.iter().chain(stx.tx.references.iter()) {
            if let Some(spender) = inner.consumed.get(r) {
                warn!(tx = %id.short(), state = %r, spender = %spender.short(), "double spend rejected");
                return Err(NotaryError::Conflict { state: *r });
            }
        }

        let ltx = stx.tx.resolve(|r| inner.unspent.get(r).cloned())?;

        let now = self.clock.now();
        if let Some(window) = ltx.time_window {
            if !window.contains(now) {
                return Err(NotaryError::OutsideTimeWindow { now });
            }
        }

        stx.verify_required_signatures()?;
        ltx.verify().map_err(LedgerError::from)?;

        #[cfg(feature = "debug-tracing")]
        debug!(tx = %id.short(), body = ?stx.tx, "committing");

        for r in &stx.tx.inputs {
            inner.unspent.remove(r);
            inner.consumed.insert(*r, id);
        }
        for (i, output) in stx.tx.outputs.iter().enumerate() {
            inner.unspent.insert(StateRef::new(id, i as u32), output.clone());
        }
        inner.transactions.insert(id, stx.clone());

        info!(
            tx = %id.short(),
            inputs = stx.tx.inputs.len(),
            outputs = stx.tx.outputs.len(),
            "transaction notarised"
        );
        Ok(id)
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn resolve_state(&self, state_ref: &StateRef) -> Option<ContractState> {
        self.inner.read().await.unspent.get(state_ref).cloned()
    }

    async fn unspent_states(&self) -> Vec<StateAndRef> {
        self.inner
            .read()
            .await
            .unspent
            .iter()
            .map(|(r, s)| StateAndRef {
                state: s.clone(),
                state_ref: *r,
            })
            .collect()
    }

    async fn transaction(&self, id: &SecureHash) -> Option<SignedTransaction> {
        self.inner.read().await.transactions.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::SystemClock;
    use crate::core::rng::SeededSecretSource;
    use crate::ledger::party::KeyPair;
    use crate::ledger::states::TokenState;
    use crate::ledger::transaction::{TimeWindow, TokenCommand, TransactionBuilder};
    use chrono::Duration;

    fn ledger() -> InMemoryLedger {
        InMemoryLedger::new(Arc::new(SystemClock))
    }

    fn issue(bank: &KeyPair, holder: &Party, amount: u64) -> SignedTransaction {
        let mut b = TransactionBuilder::new();
        let out = b.add_output(TokenState::unlocked(holder.clone(), bank.party().clone(), amount));
        b.add_command(TokenCommand::Issue { outputs: vec![out] }, vec![bank.public_key()]);
        b.sign(bank).unwrap()
    }

    fn redeem_all(bank: &KeyPair, holder: &KeyPair, input: StateAndRef) -> SignedTransaction {
        let mut b = TransactionBuilder::new();
        let i = b.add_input(input);
        b.add_command(
            TokenCommand::Redeem { inputs: vec![i], outputs: vec![] },
            vec![holder.public_key(), bank.public_key()],
        );
        let mut stx = b.sign(holder).unwrap();
        stx.sign_with(bank).unwrap();
        stx
    }

    #[tokio::test]
    async fn test_issue_and_balance() {
        let source = SeededSecretSource::new(1);
        let bank = KeyPair::generate("bank", &source);
        let alice = KeyPair::generate("alice", &source);
        let ledger = ledger();

        ledger.submit(&issue(&bank, alice.party(), 40)).await.unwrap();
        ledger.submit(&issue(&bank, alice.party(), 2)).await.unwrap();

        assert_eq!(ledger.balance(alice.party(), bank.party()).await, 42);
        assert_eq!(ledger.balance(bank.party(), bank.party()).await, 0);
        assert_eq!(ledger.transaction_count().await, 2);
    }

    #[tokio::test]
    async fn test_double_spend_conflict() {
        let source = SeededSecretSource::new(2);
        let bank = KeyPair::generate("bank", &source);
        let alice = KeyPair::generate("alice", &source);
        let ledger = ledger();

        let issued = issue(&bank, alice.party(), 5);
        ledger.submit(&issued).await.unwrap();
        let input = ledger.unspent_states().await.remove(0);

        let first = redeem_all(&bank, &alice, input.clone());
        let second = redeem_all(&bank, &alice, input.clone());

        ledger.submit(&first).await.unwrap();
        assert!(ledger.resolve_state(&input.state_ref).await.is_none());
        assert_eq!(ledger.historic_state(&input.state_ref).await, Some(input.state.clone()));

        let err = ledger.submit(&second).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(matches!(err, NotaryError::Conflict { state } if state == input.state_ref));
        assert_eq!(ledger.consumed_by(&input.state_ref).await, Some(first.id().unwrap()));
    }

    #[tokio::test]
    async fn test_resubmission_is_idempotent() {
        let source = SeededSecretSource::new(3);
        let bank = KeyPair::generate("bank", &source);
        let ledger = ledger();
        let stx = issue(&bank, bank.party(), 1);

        let a = ledger.submit(&stx).await.unwrap();
        let b = ledger.submit(&stx).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(ledger.transaction_count().await, 1);
    }

    #[tokio::test]
    async fn test_time_window_enforced() {
        let source = SeededSecretSource::new(4);
        let bank = KeyPair::generate("bank", &source);
        let ledger = ledger();

        let mut b = TransactionBuilder::new();
        let out = b.add_output(TokenState::unlocked(bank.party().clone(), bank.party().clone(), 1));
        b.add_command(TokenCommand::Issue { outputs: vec![out] }, vec![bank.public_key()]);
        b.set_time_window(TimeWindow::until_only(Utc::now() - Duration::seconds(1)));
        let stx = b.sign(&bank).unwrap();

        assert!(matches!(
            ledger.submit(&stx).await,
            Err(NotaryError::OutsideTimeWindow { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_signature_rejected() {
        let source = SeededSecretSource::new(5);
        let bank = KeyPair::generate("bank", &source);
        let alice = KeyPair::generate("alice", &source);
        let ledger = ledger();

        ledger.submit(&issue(&bank, alice.party(), 5)).await.unwrap();
        let input = ledger.unspent_states().await.remove(0);

        let mut b = TransactionBuilder::new();
        let i = b.add_input(input);
        b.add_command(
            TokenCommand::Redeem { inputs: vec![i], outputs: vec![] },
            vec![alice.public_key(), bank.public_key()],
        );
        let stx = b.sign(&alice).unwrap();

        assert!(matches!(
            ledger.submit(&stx).await,
            Err(NotaryError::Invalid(LedgerError::MissingSignatures(_)))
        ));
    }
}
