//! Game Flows
//!
//! One game is one session between a player (initiator) and a casino
//! (responder):
//!
//! ```text
//!   player                                   casino
//!   ──────                                   ──────
//!   PlayRequest ───────────────────────────►
//!               ◄─────────────────────────── CasinoCommit (hash, stake)
//!   ProposeTransaction (commit) ───────────►
//!               ◄─────────────────────────── Signature
//!   notarise, Finalised ───────────────────►       (or Retry on conflict)
//!   reveal, Revealed ──────────────────────►
//!               ◄─────────────────────────── reveal, Revealed
//!   ProposeTransaction (settle) ───────────►
//!               ◄─────────────────────────── Signature
//!   notarise, Finalised ───────────────────►
//! ```
//!
//! Both sides reveal as soon as the commit is final, without waiting for
//! the other: images are fixed by their commitments, so order cannot help
//! anyone. A side that stops answering is settled without it through
//! [`close_game`] once the reveal deadline has passed. The contract fixes
//! the split, so whoever closes gets no say in it.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::core::hash::SecureHash;
use crate::flows::checkpoint::{CasinoOffer, CasinoStage, Checkpoint, CommittedGame, PlayerStage};
use crate::flows::node::Node;
use crate::contracts::commit::{close_shares, resolution_shares};
use crate::flows::{ensure, FlowError};
use crate::game::payout::{derive_payout, PayoutTable};
use crate::ledger::party::Party;
use crate::ledger::states::{
    CommitImage, CommitmentState, ContractState, GamePointer, GameState, RevealedState, StateAndRef, StateRef,
    TokenState,
};
use crate::ledger::transaction::{
    Command, CommitCommand, SignedTransaction, TimeWindow, TokenCommand, TransactionBuilder,
};
use crate::network::protocol::FlowMessage;
use crate::network::session::{FlowSession, SessionError};

/// What a player learns from one game.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameOutcome {
    /// Why the game did not settle, if it did not.
    pub error: Option<String>,
    /// Amount paid to the player.
    pub payout: u64,
    /// Player's unlocked balance afterwards.
    pub balance: u64,
    /// Game id, once a commit proposal exists.
    pub game_id: Option<Uuid>,
}

impl GameOutcome {
    /// A game that did not settle.
    pub fn failed(reason: impl Into<String>, balance: u64) -> Self {
        Self {
            error: Some(reason.into()),
            payout: 0,
            balance,
            game_id: None,
        }
    }

    /// Settled without error.
    pub fn is_settled(&self) -> bool {
        self.error.is_none()
    }
}

fn unexpected(expected: &'static str, got: FlowMessage) -> FlowError {
    match got {
        FlowMessage::Reject { reason } => FlowError::CounterpartyRejected(reason),
        other => SessionError::Unexpected { expected, got: other.kind() }.into(),
    }
}

fn token_sum<'a>(tokens: impl IntoIterator<Item = &'a StateAndRef>) -> u64 {
    tokens
        .into_iter()
        .filter_map(|s| s.state.as_token())
        .map(|t| t.amount)
        .sum()
}

// =============================================================================
// PLAYER
// =============================================================================

/// Initiator side of a game.
pub struct PlayerFlow<'a> {
    node: &'a Node,
    session: FlowSession,
    casino: Party,
    wager: u64,
    issuer: Party,
    stage: PlayerStage,
}

impl<'a> PlayerFlow<'a> {
    /// Fresh flow over an open [`crate::network::protocol::FlowKind::Play`] session.
    pub fn new(node: &'a Node, session: FlowSession, wager: u64, issuer: Party) -> Self {
        let casino = session.counterparty().clone();
        Self {
            node,
            session,
            casino,
            wager,
            issuer,
            stage: PlayerStage::Request { attempt: 0 },
        }
    }

    /// Continue a checkpointed flow over a reconnected session.
    pub fn resume(node: &'a Node, session: FlowSession, checkpoint: Checkpoint) -> Result<Self, FlowError> {
        let Checkpoint::Player { casino, wager, issuer, stage } = checkpoint else {
            return Err(FlowError::Checkpoint("not a player checkpoint".into()));
        };
        ensure(&casino == session.counterparty(), "session does not lead to the checkpointed casino")?;

        let held: Vec<StateRef> = match &stage {
            PlayerStage::AwaitCommit { inputs, .. } => inputs.iter().map(|s| s.state_ref).collect(),
            PlayerStage::AwaitCommitSignature { spent, .. } => spent.clone(),
            _ => Vec::new(),
        };
        if !node.reserve(&held) {
            warn!(session = %session.id(), "checkpointed tokens already reserved by another flow");
        }

        info!(session = %session.id(), stage = stage_name(&stage), "resuming player flow");
        Ok(Self { node, session, casino, wager, issuer, stage })
    }

    /// Current stage.
    pub fn stage(&self) -> &PlayerStage {
        &self.stage
    }

    /// Game id, once the commit proposal exists.
    pub fn game_id(&self) -> Option<Uuid> {
        match &self.stage {
            PlayerStage::AwaitCommitSignature { game, .. }
            | PlayerStage::Reveal { game }
            | PlayerStage::AwaitCounterReveal { game, .. }
            | PlayerStage::AwaitResolveSignature { game, .. } => Some(game.game_id),
            PlayerStage::Done { outcome } => outcome.game_id,
            _ => None,
        }
    }

    /// Give the session back, e.g. to resume over it later.
    pub fn into_session(self) -> FlowSession {
        self.session
    }

    /// Drive the flow to completion.
    #[instrument(skip(self), fields(session = %self.session.id(), casino = %self.casino))]
    pub async fn run(&mut self) -> Result<GameOutcome, FlowError> {
        loop {
            if let PlayerStage::Done { outcome } = &self.stage {
                return Ok(outcome.clone());
            }
            if let Err(e) = self.step().await {
                self.abort(&e).await;
                return Err(e);
            }
        }
    }

    /// Perform one send or receive and checkpoint the resulting stage.
    pub async fn step(&mut self) -> Result<(), FlowError> {
        let next = match self.stage.clone() {
            PlayerStage::Request { attempt } => self.request(attempt).await?,
            PlayerStage::AwaitCommit { attempt, inputs } => self.propose_commit(attempt, inputs).await?,
            PlayerStage::AwaitCommitSignature { attempt, proposal, game, spent } => {
                self.finalise_commit(attempt, proposal, game, spent).await?
            }
            PlayerStage::Reveal { game } => {
                let revealed = reveal(self.node, &game).await?;
                self.session.send_message(&FlowMessage::Revealed { state: revealed }).await?;
                PlayerStage::AwaitCounterReveal { game, revealed }
            }
            PlayerStage::AwaitCounterReveal { game, revealed } => self.propose_settlement(game, revealed).await?,
            PlayerStage::AwaitResolveSignature { game, proposal, payout } => {
                self.finalise_settlement(game, proposal, payout).await?
            }
            PlayerStage::Done { .. } => return Ok(()),
        };
        self.advance(next).await
    }

    async fn advance(&mut self, next: PlayerStage) -> Result<(), FlowError> {
        debug!(session = %self.session.id(), stage = stage_name(&next), "player stage");
        self.stage = next;
        let flow_id = self.session.id();
        if matches!(self.stage, PlayerStage::Done { .. }) {
            self.node.checkpoints().remove(flow_id).await;
            return Ok(());
        }
        let checkpoint = Checkpoint::Player {
            casino: self.casino.clone(),
            wager: self.wager,
            issuer: self.issuer.clone(),
            stage: self.stage.clone(),
        };
        self.node.checkpoints().save(flow_id, &checkpoint).await
    }

    /// Release what the failed stage held and tell the casino, unless the
    /// failure came from the casino or the session itself.
    async fn abort(&mut self, error: &FlowError) {
        match &self.stage {
            PlayerStage::AwaitCommit { inputs, .. } => {
                let held: Vec<StateRef> = inputs.iter().map(|s| s.state_ref).collect();
                self.node.unreserve(&held);
            }
            PlayerStage::AwaitCommitSignature { spent, .. } => self.node.unreserve(spent),
            _ => {}
        }

        // Committed games keep their checkpoint so they can be resumed or closed.
        let committed = matches!(
            self.stage,
            PlayerStage::Reveal { .. } | PlayerStage::AwaitCounterReveal { .. } | PlayerStage::AwaitResolveSignature { .. }
        );
        if !committed {
            self.node.checkpoints().remove(self.session.id()).await;
        }

        if !matches!(error, FlowError::CounterpartyRejected(_) | FlowError::Session(_)) {
            let reject = FlowMessage::Reject { reason: error.to_string() };
            if let Err(e) = self.session.send_message(&reject).await {
                debug!(error = %e, "casino gone before reject");
            }
        }
    }

    async fn request(&self, attempt: u32) -> Result<PlayerStage, FlowError> {
        if self.wager == 0 {
            return Err(FlowError::InvalidRequest("wager must be positive".into()));
        }
        let inputs = self.node.select_tokens(&self.issuer, self.wager).await?;

        let request = FlowMessage::PlayRequest {
            wager: self.wager,
            issuer: self.issuer.clone(),
            player: self.node.party().clone(),
        };
        if let Err(e) = self.session.send_message(&request).await {
            let held: Vec<StateRef> = inputs.iter().map(|s| s.state_ref).collect();
            self.node.unreserve(&held);
            return Err(e.into());
        }
        info!(attempt, wager = self.wager, "play requested");
        Ok(PlayerStage::AwaitCommit { attempt, inputs })
    }

    async fn propose_commit(&self, attempt: u32, inputs: Vec<StateAndRef>) -> Result<PlayerStage, FlowError> {
        let (commit_hash, commit_id, casino, stake_refs, stake, paytable) = match self.session.receive_message().await? {
            FlowMessage::CasinoCommit { commit_hash, commit_id, casino, stake_refs, stake, paytable } => {
                (commit_hash, commit_id, casino, stake_refs, stake, paytable)
            }
            other => return Err(unexpected("casino_commit", other)),
        };

        ensure(casino == self.casino, "casino identity does not match the session")?;
        ensure(paytable.modulus > 0, "paytable modulus must be positive")?;
        ensure(stake >= paytable.max_payout(), "casino stake does not cover the top payout")?;
        let stake_tokens = resolve_stake(self.node, &casino, &self.issuer, &stake_refs, stake).await?;

        let terms = CasinoTerms { casino, commit_hash, commit_id, stake_tokens, stake, paytable };
        let spent: Vec<StateRef> = inputs.iter().map(|s| s.state_ref).collect();
        let (proposal, game) = build_commit(self.node, &terms, inputs, self.wager, &self.issuer)?;

        self.session
            .send_message(&FlowMessage::ProposeTransaction { tx: proposal.clone() })
            .await?;
        info!(game = %game.game_id, deadline = %game.deadline, "commit proposed");
        Ok(PlayerStage::AwaitCommitSignature { attempt, proposal, game, spent })
    }

    async fn finalise_commit(
        &self,
        attempt: u32,
        proposal: SignedTransaction,
        game: CommittedGame,
        spent: Vec<StateRef>,
    ) -> Result<PlayerStage, FlowError> {
        let stx = self.countersigned(proposal).await?;
        let result = self.node.notarise(&stx).await;
        self.node.unreserve(&spent);

        match result {
            Ok(tx_id) => {
                self.session.send_message(&FlowMessage::Finalised { tx_id }).await?;
                info!(game = %game.game_id, tx = %tx_id.short(), "game committed");
                Ok(PlayerStage::Reveal { game })
            }
            Err(e) if e.is_conflict() && attempt < self.node.config().max_notary_retries => {
                warn!(attempt, error = %e, "commit conflicted, restarting game");
                self.session.send_message(&FlowMessage::Retry { attempt }).await?;
                Ok(PlayerStage::Request { attempt: attempt + 1 })
            }
            Err(e) if e.is_conflict() => Err(FlowError::RetriesExhausted(attempt + 1)),
            Err(e) => Err(e),
        }
    }

    async fn propose_settlement(&self, game: CommittedGame, revealed: StateRef) -> Result<PlayerStage, FlowError> {
        let theirs_ref = match self.session.receive_message().await? {
            FlowMessage::Revealed { state } => state,
            other => return Err(unexpected("revealed", other)),
        };
        let theirs = check_counter_reveal(self.node, &game, theirs_ref).await?;
        let mine = live_state(self.node, revealed).await?;

        let (proposal, payout) = build_settlement(self.node, &game, mine, theirs, &self.casino).await?;
        self.session
            .send_message(&FlowMessage::ProposeTransaction { tx: proposal.clone() })
            .await?;
        info!(game = %game.game_id, payout, "settlement proposed");
        Ok(PlayerStage::AwaitResolveSignature { game, proposal, payout })
    }

    async fn finalise_settlement(
        &self,
        game: CommittedGame,
        proposal: SignedTransaction,
        payout: u64,
    ) -> Result<PlayerStage, FlowError> {
        let stx = self.countersigned(proposal).await?;
        let tx_id = self.node.notarise(&stx).await?;
        self.session.send_message(&FlowMessage::Finalised { tx_id }).await?;

        let balance = self.node.balance(&self.issuer).await;
        info!(game = %game.game_id, payout, balance, "game settled");
        Ok(PlayerStage::Done {
            outcome: GameOutcome { error: None, payout, balance, game_id: Some(game.game_id) },
        })
    }

    /// Wait for the casino's signature over `proposal` and attach it.
    async fn countersigned(&self, mut proposal: SignedTransaction) -> Result<SignedTransaction, FlowError> {
        let sig = match self.session.receive_message().await? {
            FlowMessage::Signature { sig } => sig,
            other => return Err(unexpected("signature", other)),
        };
        let id = proposal.id()?;
        ensure(
            sig.by == self.casino.owning_key && sig.verify(&id),
            "casino signature does not verify",
        )?;
        proposal.add_signature(sig);
        Ok(proposal)
    }
}

fn stage_name(stage: &PlayerStage) -> &'static str {
    match stage {
        PlayerStage::Request { .. } => "request",
        PlayerStage::AwaitCommit { .. } => "await_commit",
        PlayerStage::AwaitCommitSignature { .. } => "await_commit_signature",
        PlayerStage::Reveal { .. } => "reveal",
        PlayerStage::AwaitCounterReveal { .. } => "await_counter_reveal",
        PlayerStage::AwaitResolveSignature { .. } => "await_resolve_signature",
        PlayerStage::Done { .. } => "done",
    }
}

// =============================================================================
// CASINO
// =============================================================================

/// Responder side of a game.
pub struct CasinoFlow<'a> {
    node: &'a Node,
    session: FlowSession,
    player: Party,
    stage: CasinoStage,
}

impl<'a> CasinoFlow<'a> {
    /// Serve a freshly accepted session.
    pub fn new(node: &'a Node, session: FlowSession) -> Self {
        let player = session.counterparty().clone();
        Self {
            node,
            session,
            player,
            stage: CasinoStage::AwaitRequest { attempt: 0 },
        }
    }

    /// Continue a checkpointed flow over a reconnected session.
    pub fn resume(node: &'a Node, session: FlowSession, checkpoint: Checkpoint) -> Result<Self, FlowError> {
        let Checkpoint::Casino { player, stage } = checkpoint else {
            return Err(FlowError::Checkpoint("not a casino checkpoint".into()));
        };
        ensure(&player == session.counterparty(), "session does not lead to the checkpointed player")?;

        if let CasinoStage::AwaitProposal { offer, .. } | CasinoStage::AwaitCommitFinality { offer, .. } = &stage {
            if !node.reserve(&offer.stake_refs) {
                warn!(session = %session.id(), "checkpointed stake already reserved by another flow");
            }
        }
        Ok(Self { node, session, player, stage })
    }

    /// Current stage.
    pub fn stage(&self) -> &CasinoStage {
        &self.stage
    }

    /// Give the session back.
    pub fn into_session(self) -> FlowSession {
        self.session
    }

    /// Serve the session to completion; returns the agreed payout.
    #[instrument(skip(self), fields(session = %self.session.id(), player = %self.player))]
    pub async fn run(&mut self) -> Result<Option<u64>, FlowError> {
        loop {
            if let CasinoStage::Done { payout } = &self.stage {
                return Ok(*payout);
            }
            if let Err(e) = self.step().await {
                self.abort(&e).await;
                return Err(e);
            }
        }
    }

    /// Perform one receive (and its reply) and checkpoint the resulting stage.
    pub async fn step(&mut self) -> Result<(), FlowError> {
        let next = match self.stage.clone() {
            CasinoStage::AwaitRequest { attempt } => self.offer(attempt).await?,
            CasinoStage::AwaitProposal { attempt, offer } => self.sign_commit(attempt, offer).await?,
            CasinoStage::AwaitCommitFinality { attempt, offer, game } => {
                self.await_commit_finality(attempt, offer, game).await?
            }
            CasinoStage::Reveal { game } => {
                let revealed = reveal(self.node, &game).await?;
                self.session.send_message(&FlowMessage::Revealed { state: revealed }).await?;
                CasinoStage::AwaitCounterReveal { game, revealed }
            }
            CasinoStage::AwaitCounterReveal { game, revealed } => {
                let theirs = match self.session.receive_message().await? {
                    FlowMessage::Revealed { state } => state,
                    other => return Err(unexpected("revealed", other)),
                };
                check_counter_reveal(self.node, &game, theirs).await?;
                CasinoStage::AwaitResolveProposal { game, revealed }
            }
            CasinoStage::AwaitResolveProposal { game, revealed } => self.sign_settlement(game, revealed).await?,
            CasinoStage::AwaitSettlement { game, payout } => {
                match self.session.receive_message().await? {
                    FlowMessage::Finalised { tx_id } => {
                        ensure(
                            self.node.ledger().transaction(&tx_id).await.is_some(),
                            "settlement is not on the ledger",
                        )?;
                        info!(game = %game.game_id, payout, "game settled");
                    }
                    other => return Err(unexpected("finalised", other)),
                }
                CasinoStage::Done { payout: Some(payout) }
            }
            CasinoStage::Done { .. } => return Ok(()),
        };

        self.stage = next;
        let flow_id = self.session.id();
        if matches!(self.stage, CasinoStage::Done { .. }) {
            self.node.checkpoints().remove(flow_id).await;
            return Ok(());
        }
        let checkpoint = Checkpoint::Casino { player: self.player.clone(), stage: self.stage.clone() };
        self.node.checkpoints().save(flow_id, &checkpoint).await
    }

    async fn abort(&mut self, error: &FlowError) {
        if let CasinoStage::AwaitProposal { offer, .. } | CasinoStage::AwaitCommitFinality { offer, .. } = &self.stage {
            self.node.unreserve(&offer.stake_refs);
        }
        let committed = matches!(
            self.stage,
            CasinoStage::Reveal { .. }
                | CasinoStage::AwaitCounterReveal { .. }
                | CasinoStage::AwaitResolveProposal { .. }
                | CasinoStage::AwaitSettlement { .. }
        );
        if !committed {
            self.node.checkpoints().remove(self.session.id()).await;
        }

        if !matches!(error, FlowError::CounterpartyRejected(_) | FlowError::Session(_)) {
            let reject = FlowMessage::Reject { reason: error.to_string() };
            if let Err(e) = self.session.send_message(&reject).await {
                debug!(error = %e, "player gone before reject");
            }
        }
    }

    async fn offer(&self, attempt: u32) -> Result<CasinoStage, FlowError> {
        let (wager, issuer, player) = match self.session.receive_message().await? {
            FlowMessage::PlayRequest { wager, issuer, player } => (wager, issuer, player),
            other => return Err(unexpected("play_request", other)),
        };
        if attempt > self.node.config().max_notary_retries {
            return Err(FlowError::RetriesExhausted(attempt));
        }
        ensure(player == self.player, "player identity does not match the session")?;
        ensure(wager > 0, "wager must be positive")?;

        let paytable = self.node.config().paytable.clone();
        let stake = paytable.max_payout();
        let stake_tokens = self.node.select_tokens(&issuer, stake).await?;
        let offered = token_sum(&stake_tokens);
        let stake_refs: Vec<StateRef> = stake_tokens.iter().map(|s| s.state_ref).collect();

        let image = CommitImage::random(self.node.secrets());
        let commit_id = Uuid::new_v4();
        let commit = FlowMessage::CasinoCommit {
            commit_hash: image.hash(),
            commit_id,
            casino: self.node.party().clone(),
            stake_refs: stake_refs.clone(),
            stake,
            paytable,
        };
        if let Err(e) = self.session.send_message(&commit).await {
            self.node.unreserve(&stake_refs);
            return Err(e.into());
        }

        info!(attempt, wager, stake, "commitment offered");
        Ok(CasinoStage::AwaitProposal {
            attempt,
            offer: CasinoOffer { wager, issuer, image, commit_id, stake_refs, offered, stake },
        })
    }

    async fn sign_commit(&self, attempt: u32, offer: CasinoOffer) -> Result<CasinoStage, FlowError> {
        let stx = match self.session.receive_message().await? {
            FlowMessage::ProposeTransaction { tx } => tx,
            other => return Err(unexpected("propose_transaction", other)),
        };
        let game = check_commit_proposal(self.node, &self.player, &offer, &stx).await?;

        let sig = self.node.keys().sign(&stx.id()?);
        self.session.send_message(&FlowMessage::Signature { sig }).await?;
        debug!(game = %game.game_id, "commit countersigned");
        Ok(CasinoStage::AwaitCommitFinality { attempt, offer, game })
    }

    async fn await_commit_finality(
        &self,
        attempt: u32,
        offer: CasinoOffer,
        game: CommittedGame,
    ) -> Result<CasinoStage, FlowError> {
        match self.session.receive_message().await? {
            FlowMessage::Finalised { tx_id } => {
                ensure(tx_id == game.commit_tx, "finalised a different transaction")?;
                ensure(
                    self.node.ledger().transaction(&tx_id).await.is_some(),
                    "commit transaction is not on the ledger",
                )?;
                self.node.unreserve(&offer.stake_refs);
                info!(game = %game.game_id, deadline = %game.deadline, "game committed");
                Ok(CasinoStage::Reveal { game })
            }
            FlowMessage::Retry { attempt: failed } => {
                self.node.unreserve(&offer.stake_refs);
                warn!(attempt = failed, "player retrying after commit conflict");
                Ok(CasinoStage::AwaitRequest { attempt: attempt + 1 })
            }
            other => Err(unexpected("finalised", other)),
        }
    }

    async fn sign_settlement(&self, game: CommittedGame, revealed: StateRef) -> Result<CasinoStage, FlowError> {
        let stx = match self.session.receive_message().await? {
            FlowMessage::ProposeTransaction { tx } => tx,
            other => return Err(unexpected("propose_transaction", other)),
        };
        let payout = check_settlement(self.node, &self.player, &game, revealed, &stx).await?;

        let sig = self.node.keys().sign(&stx.id()?);
        self.session.send_message(&FlowMessage::Signature { sig }).await?;
        debug!(game = %game.game_id, payout, "settlement countersigned");
        Ok(CasinoStage::AwaitSettlement { game, payout })
    }
}

// =============================================================================
// COMMIT TRANSACTION
// =============================================================================

/// The casino's side of a game as announced to the player.
pub(crate) struct CasinoTerms {
    pub casino: Party,
    pub commit_hash: SecureHash,
    pub commit_id: Uuid,
    pub stake_tokens: Vec<StateAndRef>,
    pub stake: u64,
    pub paytable: PayoutTable,
}

/// The offered stake must be live, unlocked, the casino's, and cover `stake`.
async fn resolve_stake(
    node: &Node,
    casino: &Party,
    issuer: &Party,
    refs: &[StateRef],
    stake: u64,
) -> Result<Vec<StateAndRef>, FlowError> {
    let mut tokens = Vec::with_capacity(refs.len());
    for r in refs {
        let state = node
            .ledger()
            .resolve_state(r)
            .await
            .ok_or_else(|| FlowError::InvalidProposal(format!("offered stake {} is not live", r)))?;
        ensure(
            state.as_token().is_some_and(|t| t.is_spendable_by(casino, issuer)),
            "offered stake must be the casino's unlocked tokens",
        )?;
        tokens.push(StateAndRef { state, state_ref: *r });
    }
    ensure(token_sum(&tokens) >= stake, "offered stake does not cover the announced amount")?;
    Ok(tokens)
}

/// Lock wager and stake into one pot and create both commitments and the
/// game. Signed by us only; the casino countersigns.
pub(crate) fn build_commit(
    node: &Node,
    terms: &CasinoTerms,
    inputs: Vec<StateAndRef>,
    wager: u64,
    issuer: &Party,
) -> Result<(SignedTransaction, CommittedGame), FlowError> {
    let player = node.party().clone();
    let casino = terms.casino.clone();
    let deadline = node.clock().now() + node.config().reveal_window;
    let image = CommitImage::random(node.secrets());
    let game_id = Uuid::new_v4();
    let own_id = Uuid::new_v4();

    let own_total = token_sum(&inputs);
    let offered = token_sum(&terms.stake_tokens);
    let pot = wager
        .checked_add(terms.stake)
        .ok_or_else(|| FlowError::InvalidRequest("pot overflows".into()))?;

    let mut builder = TransactionBuilder::new();
    let lock_inputs = inputs
        .into_iter()
        .chain(terms.stake_tokens.iter().cloned())
        .map(|s| builder.add_input(s))
        .collect();

    let pot_index = builder.add_output(TokenState::locked(vec![player.clone(), casino.clone()], issuer.clone(), pot));
    let mut lock_outputs = vec![pot_index];
    if own_total > wager {
        lock_outputs.push(builder.add_output(TokenState::unlocked(player.clone(), issuer.clone(), own_total - wager)));
    }
    if offered > terms.stake {
        lock_outputs.push(builder.add_output(TokenState::unlocked(casino.clone(), issuer.clone(), offered - terms.stake)));
    }
    builder.add_command(
        TokenCommand::Lock { inputs: lock_inputs, outputs: lock_outputs },
        vec![player.owning_key, casino.owning_key],
    );

    // Commitments first, the game right after them.
    let own_index = builder.next_output_index();
    let game_index = own_index + 2;
    let pointer = GamePointer { game_id, output_index: game_index as u32 };
    builder.add_output(CommitmentState {
        hash: image.hash(),
        creator: player.clone(),
        reveal_deadline: deadline,
        game: pointer,
        id: own_id,
    });
    let their_index = builder.add_output(CommitmentState {
        hash: terms.commit_hash,
        creator: casino.clone(),
        reveal_deadline: deadline,
        game: pointer,
        id: terms.commit_id,
    });
    builder.add_output(GameState {
        commit_ids: vec![own_id, terms.commit_id],
        participants: vec![player.clone(), casino.clone()],
        id: game_id,
        stakes: vec![wager, terms.stake],
        reveal_deadline: deadline,
        paytable: terms.paytable.clone(),
    });
    builder.add_command(CommitCommand::Commit { output: own_index }, vec![player.owning_key]);
    builder.add_command(CommitCommand::Commit { output: their_index }, vec![casino.owning_key]);
    builder.set_time_window(TimeWindow::until_only(deadline));

    let stx = builder.sign(node.keys())?;
    let game = CommittedGame {
        game_id,
        commit_tx: stx.id()?,
        deadline,
        own_commitment: own_index as u32,
        their_commitment: their_index as u32,
        their_commit_id: terms.commit_id,
        game_index: game_index as u32,
        pot_index: pot_index as u32,
        pot,
        image,
        paytable: terms.paytable.clone(),
    };
    Ok((stx, game))
}

/// Casino-side check of the player's commit proposal.
async fn check_commit_proposal(
    node: &Node,
    player: &Party,
    offer: &CasinoOffer,
    stx: &SignedTransaction,
) -> Result<CommittedGame, FlowError> {
    let ltx = node.verify_proposal(stx).await?;
    let me = node.party();

    ensure(
        ltx.commands.iter().all(|c| {
            matches!(
                c.value,
                Command::Token(TokenCommand::Lock { .. }) | Command::Commit(CommitCommand::Commit { .. })
            )
        }),
        "commit proposal may only lock tokens and create commitments",
    )?;
    ensure(
        ltx.inputs.iter().all(|s| s.state.as_token().is_some()),
        "commit proposal may only consume tokens",
    )?;

    let deadline = ltx
        .time_window
        .and_then(|w| w.until)
        .ok_or_else(|| FlowError::InvalidProposal("commit proposal needs a reveal deadline".into()))?;
    ensure(
        deadline >= node.clock().now() + node.config().min_reveal_window,
        "reveal deadline leaves too little time to reveal",
    )?;

    let (own_index, own) = ltx
        .outputs
        .iter()
        .enumerate()
        .find_map(|(i, s)| s.as_commitment().filter(|c| c.id == offer.commit_id).map(|c| (i, c)))
        .ok_or_else(|| FlowError::InvalidProposal("our commitment is missing".into()))?;
    ensure(own.hash == offer.image.hash(), "our commitment carries the wrong hash")?;
    ensure(&own.creator == me, "our commitment names another creator")?;
    ensure(own.reveal_deadline == deadline, "our commitment deadline differs from the window")?;

    let game_index = own.game.output_index as usize;
    let game = ltx
        .outputs
        .get(game_index)
        .and_then(ContractState::as_game)
        .ok_or_else(|| FlowError::InvalidProposal("game record is missing".into()))?;
    ensure(
        game.participants.as_slice() == [player.clone(), me.clone()],
        "game participants must be the player, then us",
    )?;
    ensure(game.commit_ids.len() == 2, "game must hold exactly two commitments")?;
    ensure(
        game.stakes.as_slice() == [offer.wager, offer.stake],
        "game stakes differ from the wager and our stake",
    )?;
    ensure(game.reveal_deadline == deadline, "game deadline differs from the window")?;
    ensure(game.paytable == node.config().paytable, "game pays out against another table")?;

    let (their_index, theirs) = ltx
        .outputs
        .iter()
        .enumerate()
        .find_map(|(i, s)| {
            s.as_commitment()
                .filter(|c| c.id != offer.commit_id && c.game == own.game)
                .map(|c| (i, c))
        })
        .ok_or_else(|| FlowError::InvalidProposal("player commitment is missing".into()))?;
    ensure(&theirs.creator == player, "player commitment names another creator")?;
    ensure(theirs.reveal_deadline == deadline, "commitment deadlines differ")?;

    let locked: Vec<(usize, &TokenState)> = ltx
        .outputs
        .iter()
        .enumerate()
        .filter_map(|(i, s)| s.as_token().filter(|t| t.locked).map(|t| (i, t)))
        .collect();
    ensure(locked.len() == 1, "commit proposal must lock exactly one pot")?;
    let (pot_index, pot) = locked[0];
    ensure(
        Some(pot.amount) == offer.wager.checked_add(offer.stake),
        "pot must hold the wager plus our stake",
    )?;
    ensure(pot.issuer == offer.issuer, "pot is from the wrong issuer")?;
    ensure(
        pot.participants.len() == 2 && pot.participants.contains(me) && pot.participants.contains(player),
        "pot must be held by the player and us",
    )?;

    let mut ours: Vec<StateRef> = ltx
        .inputs
        .iter()
        .filter(|s| s.state.as_token().is_some_and(|t| t.holder.as_ref() == Some(me)))
        .map(|s| s.state_ref)
        .collect();
    let mut offered = offer.stake_refs.clone();
    ours.sort();
    offered.sort();
    ensure(ours == offered, "proposal must spend exactly the offered stake")?;

    let change: u64 = ltx
        .outputs
        .iter()
        .filter_map(ContractState::as_token)
        .filter(|t| t.holder.as_ref() == Some(me))
        .map(|t| t.amount)
        .sum();
    ensure(change == offer.offered.saturating_sub(offer.stake), "our change is wrong")?;

    Ok(CommittedGame {
        game_id: game.id,
        commit_tx: ltx.id,
        deadline,
        own_commitment: own_index as u32,
        their_commitment: their_index as u32,
        their_commit_id: theirs.id,
        game_index: game_index as u32,
        pot_index: pot_index as u32,
        pot: pot.amount,
        image: offer.image,
        paytable: node.config().paytable.clone(),
    })
}

// =============================================================================
// REVEAL
// =============================================================================

async fn live_state(node: &Node, state_ref: StateRef) -> Result<StateAndRef, FlowError> {
    let state = node
        .ledger()
        .resolve_state(&state_ref)
        .await
        .ok_or_else(|| FlowError::InvalidProposal(format!("{} is not live", state_ref)))?;
    Ok(StateAndRef { state, state_ref })
}

/// Replace our commitment with its image. A commitment already revealed
/// by an earlier run of the flow yields the existing record.
async fn reveal(node: &Node, game: &CommittedGame) -> Result<StateRef, FlowError> {
    let commitment_ref = game.output_ref(game.own_commitment);
    let commitment = node
        .ledger()
        .historic_state(&commitment_ref)
        .await
        .and_then(|s| s.as_commitment().cloned())
        .ok_or(FlowError::UnknownGame(game.game_id))?;

    if node.ledger().resolve_state(&commitment_ref).await.is_none() {
        return node
            .ledger()
            .unspent_states()
            .await
            .into_iter()
            .find(|s| s.state.as_revealed().is_some_and(|r| r.id == commitment.id))
            .map(|s| s.state_ref)
            .ok_or_else(|| FlowError::InvalidRequest(format!("commitment {} is no longer live", commitment.id)));
    }

    let game_record = live_state(node, game.output_ref(game.game_index)).await?;
    let mut builder = TransactionBuilder::new();
    let input = builder.add_input(StateAndRef { state: commitment.clone().into(), state_ref: commitment_ref });
    builder.add_reference(game_record);
    let output = builder.add_output(RevealedState::from_commitment(&commitment, game.image));
    builder.add_command(CommitCommand::Reveal { input, output }, vec![node.keys().public_key()]);
    builder.set_time_window(TimeWindow::until_only(game.deadline));

    let stx = builder.sign(node.keys())?;
    let tx_id = node.notarise(&stx).await?;
    info!(game = %game.game_id, tx = %tx_id.short(), "image revealed");
    Ok(stx.out_ref(output)?)
}

/// The counterparty's reveal must be live and belong to its commitment in
/// this game.
async fn check_counter_reveal(node: &Node, game: &CommittedGame, state_ref: StateRef) -> Result<StateAndRef, FlowError> {
    let theirs = live_state(node, state_ref).await?;
    ensure(
        theirs
            .state
            .as_revealed()
            .is_some_and(|r| r.id == game.their_commit_id && r.game.game_id == game.game_id),
        "counterparty reveal is not for this game",
    )?;
    Ok(theirs)
}

// =============================================================================
// SETTLEMENT
// =============================================================================

/// Consume both reveals, the game and the pot; pay the derived payout to
/// the player and the rest to the casino.
async fn build_settlement(
    node: &Node,
    game: &CommittedGame,
    mine: StateAndRef,
    theirs: StateAndRef,
    casino: &Party,
) -> Result<(SignedTransaction, u64), FlowError> {
    let images: Vec<CommitImage> = [&mine, &theirs]
        .iter()
        .filter_map(|s| s.state.as_revealed())
        .map(|r| r.image)
        .collect();

    let game_record = live_state(node, game.output_ref(game.game_index)).await?;
    let pot = live_state(node, game.output_ref(game.pot_index)).await?;
    let record = game_record
        .state
        .as_game()
        .ok_or(FlowError::UnknownGame(game.game_id))?;
    let token = pot
        .state
        .as_token()
        .cloned()
        .ok_or_else(|| FlowError::InvalidRequest("pot is not a token".into()))?;
    let shares = resolution_shares(record, token.amount, &images)?;
    let payout = shares.first().map_or(0, |(_, amount)| *amount);

    let me = node.party();
    let both = vec![me.owning_key, casino.owning_key];
    let mut builder = TransactionBuilder::new();
    for revealed in [mine, theirs] {
        let input = builder.add_input(revealed);
        builder.add_command(CommitCommand::Use { input }, vec![me.owning_key]);
    }
    let input = builder.add_input(game_record);
    builder.add_command(CommitCommand::Resolve { input }, both.clone());

    let pot_input = builder.add_input(pot);
    let outputs = release_outputs(&mut builder, shares, &token.issuer);
    builder.add_command(TokenCommand::Release { inputs: vec![pot_input], outputs }, both);

    Ok((builder.sign(node.keys())?, payout))
}

/// One unlocked output per non-zero share.
fn release_outputs(builder: &mut TransactionBuilder, shares: Vec<(Party, u64)>, issuer: &Party) -> Vec<usize> {
    shares
        .into_iter()
        .filter(|(_, amount)| *amount > 0)
        .map(|(party, amount)| builder.add_output(TokenState::unlocked(party, issuer.clone(), amount)))
        .collect()
}

/// Casino-side check of the settlement: only this game's records are
/// consumed and the casino receives the pot minus the recomputed payout.
async fn check_settlement(
    node: &Node,
    player: &Party,
    game: &CommittedGame,
    revealed: StateRef,
    stx: &SignedTransaction,
) -> Result<u64, FlowError> {
    let ltx = node.verify_proposal(stx).await?;
    let me = node.party();

    ensure(ltx.inputs.len() == 4, "settlement must consume the game, the pot and both reveals")?;
    for required in [game.output_ref(game.game_index), game.output_ref(game.pot_index), revealed] {
        ensure(
            ltx.inputs.iter().any(|s| s.state_ref == required),
            "settlement is missing one of this game's records",
        )?;
    }
    let reveals: Vec<&RevealedState> = ltx
        .inputs
        .iter()
        .filter_map(|s| s.state.as_revealed())
        .filter(|r| r.game.game_id == game.game_id)
        .collect();
    ensure(reveals.len() == 2, "settlement must use both reveals")?;
    ensure(
        reveals.iter().any(|r| r.id == game.their_commit_id),
        "settlement uses a foreign reveal",
    )?;

    let images: Vec<CommitImage> = reveals.iter().map(|r| r.image).collect();
    let payout = derive_payout(&images, &game.paytable)?;

    let paid_to = |party: &Party| -> u64 {
        ltx.outputs
            .iter()
            .filter_map(ContractState::as_token)
            .filter(|t| t.holder.as_ref() == Some(party))
            .map(|t| t.amount)
            .sum()
    };
    ensure(paid_to(player) == payout, "player output differs from the derived payout")?;
    ensure(
        paid_to(me) == game.pot.saturating_sub(payout),
        "settlement must pay us the pot minus the payout",
    )?;
    Ok(payout)
}

// =============================================================================
// CLOSE
// =============================================================================

/// Settle a stalled game once its reveal deadline has passed, without
/// the counterparty.
///
/// When every commitment was revealed the game is resolved at the derived
/// payout. Otherwise the unrevealed commitments are closed and the pot goes
/// to whoever revealed; a party that withheld its image forfeits its stake.
/// If nobody revealed, every participant gets back what it locked.
#[instrument(skip(node), fields(party = %node.party()))]
pub(crate) async fn close_game(node: &Node, game_id: Uuid) -> Result<SignedTransaction, FlowError> {
    let unspent = node.ledger().unspent_states().await;
    let game = unspent
        .iter()
        .find(|s| s.state.as_game().is_some_and(|g| g.id == game_id))
        .cloned()
        .ok_or(FlowError::UnknownGame(game_id))?;
    let record = game.state.as_game().cloned().ok_or(FlowError::UnknownGame(game_id))?;
    if !record.participants.contains(node.party()) {
        return Err(FlowError::UnknownGame(game_id));
    }

    let now = node.clock().now();
    if now <= record.reveal_deadline {
        return Err(FlowError::DeadlineNotReached(record.reveal_deadline));
    }

    let commitments: Vec<StateAndRef> = unspent
        .iter()
        .filter(|s| s.state.as_commitment().is_some_and(|c| c.game.game_id == game_id))
        .cloned()
        .collect();
    let revealed: Vec<StateAndRef> = unspent
        .iter()
        .filter(|s| s.state.as_revealed().is_some_and(|r| r.game.game_id == game_id))
        .cloned()
        .collect();
    let (pot, token) = unspent
        .iter()
        .find_map(|s| {
            s.state
                .as_token()
                .filter(|t| t.locked && s.state_ref.txhash == game.state_ref.txhash)
                .map(|t| (s.clone(), t.clone()))
        })
        .ok_or_else(|| FlowError::InvalidRequest(format!("pot of game {} is already spent", game_id)))?;

    let reveals: Vec<&RevealedState> = revealed.iter().filter_map(|s| s.state.as_revealed()).collect();
    let resolving = commitments.is_empty();
    let shares = if resolving {
        let images: Vec<CommitImage> = reveals.iter().map(|r| r.image).collect();
        resolution_shares(&record, token.amount, &images)?
    } else {
        let revealers: Vec<&Party> = reveals.iter().map(|r| &r.creator).collect();
        close_shares(&record, token.amount, &revealers)
    };
    let revealers = reveals.len();

    let me = node.keys().public_key();
    let mut builder = TransactionBuilder::new();
    for commitment in commitments {
        let input = builder.add_input(commitment);
        builder.add_command(CommitCommand::Close { input }, vec![me]);
    }
    for used in revealed {
        let input = builder.add_input(used);
        builder.add_command(CommitCommand::Use { input }, vec![me]);
    }
    let input = builder.add_input(game);
    if resolving {
        builder.add_command(CommitCommand::Resolve { input }, vec![me]);
    } else {
        builder.add_command(CommitCommand::Close { input }, vec![me]);
    }

    let input = builder.add_input(pot);
    let outputs = release_outputs(&mut builder, shares, &token.issuer);
    builder.add_command(TokenCommand::Release { inputs: vec![input], outputs }, vec![me]);
    builder.set_time_window(TimeWindow::from_only(now));

    let stx = builder.sign(node.keys())?;
    let tx_id = node.notarise(&stx).await?;
    info!(game = %game_id, tx = %tx_id.short(), revealers, resolved = resolving, "game closed");
    Ok(stx)
}
