//! Transactions
//!
//! A transaction names the records it consumes (inputs), the records it
//! reads without consuming (references), the records it produces
//! (outputs), typed commands with their required signers, and an
//! optional time window. It is accepted only if every contract accepts it
//! and every required signer has signed its id.

use std::collections::BTreeSet;
use std::io::Write;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::core::hash::{SecureHash, TX_DOMAIN};
use crate::ledger::party::{KeyPair, PublicKey, TransactionSignature};
use crate::ledger::states::{ContractState, StateAndRef, StateRef};
use crate::ledger::LedgerError;

// =============================================================================
// TIME WINDOW
// =============================================================================

/// Validity interval. `from` is inclusive, `until` is exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Earliest accepted instant.
    pub from: Option<DateTime<Utc>>,
    /// Instant from which the transaction is no longer accepted.
    pub until: Option<DateTime<Utc>>,
}

impl TimeWindow {
    /// Valid from `from` onwards.
    pub fn from_only(from: DateTime<Utc>) -> Self {
        Self { from: Some(from), until: None }
    }

    /// Valid before `until`.
    pub fn until_only(until: DateTime<Utc>) -> Self {
        Self { from: None, until: Some(until) }
    }

    /// Valid in `[from, until)`.
    pub fn between(from: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self { from: Some(from), until: Some(until) }
    }

    /// Whether `instant` falls inside the window.
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| instant >= from)
            && self.until.map_or(true, |until| instant < until)
    }
}

// =============================================================================
// COMMANDS
// =============================================================================

/// Token family instructions. Indices point into the transaction's
/// input and output lists.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenCommand {
    /// Create new unlocked tokens.
    Issue {
        /// Issued outputs.
        outputs: Vec<usize>,
    },
    /// Move value into locked tokens.
    Lock {
        /// Consumed tokens.
        inputs: Vec<usize>,
        /// Produced tokens.
        outputs: Vec<usize>,
    },
    /// Move value out of locked tokens.
    Release {
        /// Consumed tokens.
        inputs: Vec<usize>,
        /// Produced tokens.
        outputs: Vec<usize>,
    },
    /// Destroy unlocked tokens.
    Redeem {
        /// Consumed tokens.
        inputs: Vec<usize>,
        /// Change outputs.
        outputs: Vec<usize>,
    },
}

/// Commit/reveal family instructions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitCommand {
    /// Create a commitment (and, implicitly, the game it points at).
    Commit {
        /// Commitment output.
        output: usize,
    },
    /// Replace a commitment with its revealed image.
    Reveal {
        /// Commitment input.
        input: usize,
        /// Revealed output.
        output: usize,
    },
    /// Consume a revealed image during settlement.
    Use {
        /// Revealed input.
        input: usize,
    },
    /// Consume a fully revealed game.
    Resolve {
        /// Game input.
        input: usize,
    },
    /// Consume an expired commitment or an unresolved game.
    Close {
        /// Commitment or game input.
        input: usize,
    },
}

/// Leaderboard family instructions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaderboardCommand {
    /// Publish a new entry.
    Create {
        /// Entry output.
        output: usize,
    },
    /// Replace an entry with a strictly higher one.
    Overtake {
        /// Retired entry.
        input: usize,
        /// Replacing entry.
        output: usize,
    },
    /// Withdraw an entry.
    Retire {
        /// Retired entry.
        input: usize,
    },
}

/// Every command the ledger understands.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Token family.
    Token(TokenCommand),
    /// Commit/reveal family.
    Commit(CommitCommand),
    /// Leaderboard family.
    Leaderboard(LeaderboardCommand),
}

impl From<TokenCommand> for Command {
    fn from(c: TokenCommand) -> Self {
        Self::Token(c)
    }
}

impl From<CommitCommand> for Command {
    fn from(c: CommitCommand) -> Self {
        Self::Commit(c)
    }
}

impl From<LeaderboardCommand> for Command {
    fn from(c: LeaderboardCommand) -> Self {
        Self::Leaderboard(c)
    }
}

/// A command plus the keys that must sign for it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandWithSigners {
    /// Instruction.
    pub value: Command,
    /// Required signers.
    pub signers: Vec<PublicKey>,
}

impl CommandWithSigners {
    /// Whether `key` is among the signers.
    pub fn signed_by(&self, key: &PublicKey) -> bool {
        self.signers.contains(key)
    }
}

// =============================================================================
// WIRE / SIGNED / LEDGER TRANSACTIONS
// =============================================================================

/// Unresolved transaction as it travels between parties.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireTransaction {
    /// Consumed records.
    pub inputs: Vec<StateRef>,
    /// Read-only records.
    pub references: Vec<StateRef>,
    /// Produced records.
    pub outputs: Vec<ContractState>,
    /// Instructions.
    pub commands: Vec<CommandWithSigners>,
    /// Validity interval.
    pub time_window: Option<TimeWindow>,
    /// Random salt keeping ids of identical bodies distinct.
    pub privacy_salt: Uuid,
}

/// Adapter so bincode can stream straight into the hasher.
struct HashWriter<'a>(&'a mut Sha256);

impl Write for HashWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl WireTransaction {
    /// Transaction id: SHA-256 over the domain tag and the bincode body.
    pub fn id(&self) -> Result<SecureHash, LedgerError> {
        let mut hasher = Sha256::new();
        hasher.update(TX_DOMAIN);
        bincode::serialize_into(HashWriter(&mut hasher), self)?;
        Ok(SecureHash(hasher.finalize().into()))
    }

    /// Union of all command signers.
    pub fn required_signers(&self) -> BTreeSet<PublicKey> {
        self.commands
            .iter()
            .flat_map(|c| c.signers.iter().copied())
            .collect()
    }

    /// Resolve inputs and references through `lookup`.
    pub fn resolve<F>(&self, lookup: F) -> Result<LedgerTransaction, LedgerError>
    where
        F: Fn(&StateRef) -> Option<ContractState>,
    {
        let load = |refs: &[StateRef]| -> Result<Vec<StateAndRef>, LedgerError> {
            refs.iter()
                .map(|r| {
                    lookup(r)
                        .map(|state| StateAndRef { state, state_ref: *r })
                        .ok_or(LedgerError::UnknownState(*r))
                })
                .collect()
        };

        Ok(LedgerTransaction {
            id: self.id()?,
            inputs: load(&self.inputs)?,
            references: load(&self.references)?,
            outputs: self.outputs.clone(),
            commands: self.commands.clone(),
            time_window: self.time_window,
        })
    }
}

/// Wire transaction plus collected signatures.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    /// Body.
    pub tx: WireTransaction,
    /// Signatures over the body's id.
    pub sigs: Vec<TransactionSignature>,
}

impl SignedTransaction {
    /// Wrap an unsigned body.
    pub fn new(tx: WireTransaction) -> Self {
        Self { tx, sigs: Vec::new() }
    }

    /// Transaction id.
    pub fn id(&self) -> Result<SecureHash, LedgerError> {
        self.tx.id()
    }

    /// Add a signature produced by `keys`.
    pub fn sign_with(&mut self, keys: &KeyPair) -> Result<TransactionSignature, LedgerError> {
        let sig = keys.sign(&self.id()?);
        self.add_signature(sig.clone());
        Ok(sig)
    }

    /// Attach a signature collected from a counterparty.
    pub fn add_signature(&mut self, sig: TransactionSignature) {
        if !self.sigs.iter().any(|s| s.by == sig.by) {
            self.sigs.push(sig);
        }
    }

    /// Keys that have signed.
    pub fn signed_keys(&self) -> BTreeSet<PublicKey> {
        self.sigs.iter().map(|s| s.by).collect()
    }

    /// Reference to output `index`.
    pub fn out_ref(&self, index: usize) -> Result<StateRef, LedgerError> {
        Ok(StateRef::new(self.id()?, index as u32))
    }

    /// Every signature is valid and every required signer except `allowed_missing` signed.
    pub fn verify_signatures_except(&self, allowed_missing: &[PublicKey]) -> Result<(), LedgerError> {
        let id = self.id()?;
        if let Some(bad) = self.sigs.iter().find(|s| !s.verify(&id)) {
            return Err(LedgerError::InvalidSignature(bad.by));
        }

        let signed = self.signed_keys();
        let missing: Vec<PublicKey> = self
            .tx
            .required_signers()
            .into_iter()
            .filter(|k| !signed.contains(k) && !allowed_missing.contains(k))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(LedgerError::MissingSignatures(missing))
        }
    }

    /// Every required signer signed.
    pub fn verify_required_signatures(&self) -> Result<(), LedgerError> {
        self.verify_signatures_except(&[])
    }
}

/// Transaction with inputs and references resolved to their records.
///
/// This is what contracts see.
#[derive(Clone, Debug)]
pub struct LedgerTransaction {
    /// Transaction id.
    pub id: SecureHash,
    /// Consumed records.
    pub inputs: Vec<StateAndRef>,
    /// Read-only records.
    pub references: Vec<StateAndRef>,
    /// Produced records.
    pub outputs: Vec<ContractState>,
    /// Instructions.
    pub commands: Vec<CommandWithSigners>,
    /// Validity interval.
    pub time_window: Option<TimeWindow>,
}

impl LedgerTransaction {
    /// Run every contract family against this transaction.
    pub fn verify(&self) -> Result<(), crate::contracts::ContractError> {
        crate::contracts::verify_transaction(self)
    }
}

// =============================================================================
// BUILDER
// =============================================================================

/// Incrementally assembles a transaction, keeping resolved inputs so the
/// builder can verify locally before asking anyone to sign.
#[derive(Clone, Debug, Default)]
pub struct TransactionBuilder {
    inputs: Vec<StateAndRef>,
    references: Vec<StateAndRef>,
    outputs: Vec<ContractState>,
    commands: Vec<CommandWithSigners>,
    time_window: Option<TimeWindow>,
}

impl TransactionBuilder {
    /// Empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a record; returns its input index.
    pub fn add_input(&mut self, input: StateAndRef) -> usize {
        self.inputs.push(input);
        self.inputs.len() - 1
    }

    /// Read a record without consuming it.
    pub fn add_reference(&mut self, reference: StateAndRef) -> usize {
        self.references.push(reference);
        self.references.len() - 1
    }

    /// Produce a record; returns its output index.
    pub fn add_output(&mut self, output: impl Into<ContractState>) -> usize {
        self.outputs.push(output.into());
        self.outputs.len() - 1
    }

    /// Index the next output will get.
    pub fn next_output_index(&self) -> usize {
        self.outputs.len()
    }

    /// Attach a command.
    pub fn add_command(&mut self, value: impl Into<Command>, signers: Vec<PublicKey>) {
        self.commands.push(CommandWithSigners {
            value: value.into(),
            signers,
        });
    }

    /// Set the validity interval.
    pub fn set_time_window(&mut self, window: TimeWindow) {
        self.time_window = Some(window);
    }

    /// Freeze into a wire transaction with a fresh salt.
    pub fn to_wire(&self) -> WireTransaction {
        WireTransaction {
            inputs: self.inputs.iter().map(|i| i.state_ref).collect(),
            references: self.references.iter().map(|r| r.state_ref).collect(),
            outputs: self.outputs.clone(),
            commands: self.commands.clone(),
            time_window: self.time_window,
            privacy_salt: Uuid::new_v4(),
        }
    }

    /// Freeze, verify contracts locally, and sign with `keys`.
    pub fn sign(&self, keys: &KeyPair) -> Result<SignedTransaction, LedgerError> {
        let wire = self.to_wire();
        let ltx = LedgerTransaction {
            id: wire.id()?,
            inputs: self.inputs.clone(),
            references: self.references.clone(),
            outputs: self.outputs.clone(),
            commands: self.commands.clone(),
            time_window: self.time_window,
        };
        ltx.verify()?;

        let mut stx = SignedTransaction::new(wire);
        stx.sign_with(keys)?;
        Ok(stx)
    }
}
