//! Flow Checkpoints
//!
//! A flow's stage is written here after every completed send or receive.
//! The stage carries everything needed to continue, including the local
//! secret image, so checkpoints never leave the node.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::core::hash::SecureHash;
use crate::flows::play::GameOutcome;
use crate::flows::FlowError;
use crate::game::payout::PayoutTable;
use crate::ledger::party::Party;
use crate::ledger::states::{CommitImage, StateAndRef, StateRef};
use crate::ledger::transaction::SignedTransaction;

/// What both roles remember about a notarised commit transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedGame {
    /// Game id.
    pub game_id: Uuid,
    /// Id of the transaction that created the game.
    pub commit_tx: SecureHash,
    /// Last instant a reveal is accepted.
    pub deadline: DateTime<Utc>,
    /// Output index of our commitment.
    pub own_commitment: u32,
    /// Output index of the counterparty's commitment.
    pub their_commitment: u32,
    /// Id of the counterparty's commitment, inherited by its reveal.
    pub their_commit_id: Uuid,
    /// Output index of the game record.
    pub game_index: u32,
    /// Output index of the locked pot.
    pub pot_index: u32,
    /// Locked amount.
    pub pot: u64,
    /// Our secret.
    pub image: CommitImage,
    /// Table the game pays out against.
    pub paytable: PayoutTable,
}

impl CommittedGame {
    /// Reference to an output of the commit transaction.
    pub fn output_ref(&self, index: u32) -> StateRef {
        StateRef::new(self.commit_tx, index)
    }
}

/// Casino's half of a game before the commit transaction exists.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CasinoOffer {
    /// Player's wager.
    pub wager: u64,
    /// Issuer of the wagered tokens.
    pub issuer: Party,
    /// Casino's secret.
    pub image: CommitImage,
    /// Id the casino's commitment must carry.
    pub commit_id: Uuid,
    /// Offered tokens.
    pub stake_refs: Vec<StateRef>,
    /// Sum of the offered tokens.
    pub offered: u64,
    /// Amount locked from the offer.
    pub stake: u64,
}

/// Player resume points.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerStage {
    /// Send the play request.
    Request {
        /// Attempts consumed by notary conflicts.
        attempt: u32,
    },
    /// Wait for the casino's commitment.
    AwaitCommit {
        /// Current attempt.
        attempt: u32,
        /// Our tokens picked for the wager.
        inputs: Vec<StateAndRef>,
    },
    /// Wait for the casino to countersign the commit transaction.
    AwaitCommitSignature {
        /// Current attempt.
        attempt: u32,
        /// Our signed proposal.
        proposal: SignedTransaction,
        /// Game as it will be once notarised.
        game: CommittedGame,
        /// Our tokens consumed by the proposal.
        spent: Vec<StateRef>,
    },
    /// Reveal our image.
    Reveal {
        /// The committed game.
        game: CommittedGame,
    },
    /// Wait for the casino's reveal.
    AwaitCounterReveal {
        /// The committed game.
        game: CommittedGame,
        /// Our revealed record.
        revealed: StateRef,
    },
    /// Wait for the casino to countersign settlement.
    AwaitResolveSignature {
        /// The committed game.
        game: CommittedGame,
        /// Our signed settlement.
        proposal: SignedTransaction,
        /// Derived payout.
        payout: u64,
    },
    /// Finished.
    Done {
        /// Final result.
        outcome: GameOutcome,
    },
}

/// Casino resume points.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CasinoStage {
    /// Wait for a play request.
    AwaitRequest {
        /// Requests served in this session, retries included.
        attempt: u32,
    },
    /// Wait for the player's commit proposal.
    AwaitProposal {
        /// Current attempt.
        attempt: u32,
        /// Our side of the game.
        offer: CasinoOffer,
    },
    /// Wait for the player to notarise the commit transaction.
    AwaitCommitFinality {
        /// Current attempt.
        attempt: u32,
        /// Our side of the game.
        offer: CasinoOffer,
        /// The game, keyed on the proposal id.
        game: CommittedGame,
    },
    /// Reveal our image as soon as the game is committed.
    Reveal {
        /// The committed game.
        game: CommittedGame,
    },
    /// Wait for the player's reveal.
    AwaitCounterReveal {
        /// The committed game.
        game: CommittedGame,
        /// Our revealed record.
        revealed: StateRef,
    },
    /// Wait for the settlement proposal.
    AwaitResolveProposal {
        /// The committed game.
        game: CommittedGame,
        /// Our revealed record.
        revealed: StateRef,
    },
    /// Wait for the settlement to be notarised.
    AwaitSettlement {
        /// The committed game.
        game: CommittedGame,
        /// Payout we agreed to.
        payout: u64,
    },
    /// Finished.
    Done {
        /// Payout to the player, if the game settled.
        payout: Option<u64>,
    },
}

/// A serialised flow.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Checkpoint {
    /// Initiator of a game.
    Player {
        /// Counterparty.
        casino: Party,
        /// Amount wagered.
        wager: u64,
        /// Token issuer.
        issuer: Party,
        /// Where to continue.
        stage: PlayerStage,
    },
    /// Responder of a game.
    Casino {
        /// Counterparty.
        player: Party,
        /// Where to continue.
        stage: CasinoStage,
    },
}

/// Durable home for checkpoints, keyed by session id.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Store or replace.
    async fn save(&self, flow_id: Uuid, checkpoint: &Checkpoint) -> Result<(), FlowError>;

    /// Read back.
    async fn load(&self, flow_id: Uuid) -> Result<Option<Checkpoint>, FlowError>;

    /// Forget a finished flow.
    async fn remove(&self, flow_id: Uuid);

    /// Flows with a stored checkpoint.
    async fn pending(&self) -> Vec<Uuid>;
}

/// Checkpoints kept as JSON in memory.
#[derive(Default)]
pub struct InMemoryCheckpoints {
    entries: RwLock<BTreeMap<Uuid, String>>,
}

impl InMemoryCheckpoints {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpoints {
    async fn save(&self, flow_id: Uuid, checkpoint: &Checkpoint) -> Result<(), FlowError> {
        let json = serde_json::to_string(checkpoint)?;
        self.entries.write().await.insert(flow_id, json);
        Ok(())
    }

    async fn load(&self, flow_id: Uuid) -> Result<Option<Checkpoint>, FlowError> {
        match self.entries.read().await.get(&flow_id) {
            Some(json) => Ok(Some(serde_json::from_str(json)?)),
            None => Ok(None),
        }
    }

    async fn remove(&self, flow_id: Uuid) {
        self.entries.write().await.remove(&flow_id);
    }

    async fn pending(&self) -> Vec<Uuid> {
        self.entries.read().await.keys().copied().collect()
    }
}
