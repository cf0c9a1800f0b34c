//! Party Node
//!
//! One party's keys plus handles to the shared collaborators, and the
//! entry points callers use to start flows. Inbound sessions are served
//! by [`Node::spawn_responders`], one task per session.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::core::clock::Clock;
use crate::core::hash::SecureHash;
use crate::core::rng::SecretSource;
use crate::flows::checkpoint::{CheckpointStore, InMemoryCheckpoints};
use crate::flows::config::FlowConfig;
use crate::flows::play::{self, CasinoFlow, GameOutcome, PlayerFlow};
use crate::flows::{leaderboard, tokens, FlowError};
use crate::ledger::party::{KeyPair, Party};
use crate::ledger::states::{LeaderboardEntry, StateAndRef, StateRef};
use crate::ledger::store::{resolve_transaction, LedgerStore, Notary};
use crate::ledger::transaction::{LedgerTransaction, SignedTransaction};
use crate::ledger::LedgerError;
use crate::network::directory::{IdentityResolver, InboundSession, Network, NetworkAddress, Peer};
use crate::network::protocol::FlowKind;
use crate::network::session::FlowSession;

/// Collaborators shared by every node in a deployment.
#[derive(Clone)]
pub struct NodeServices {
    /// Record lookup.
    pub ledger: Arc<dyn LedgerStore>,
    /// Uniqueness service.
    pub notary: Arc<dyn Notary>,
    /// Handle resolution.
    pub directory: Arc<dyn IdentityResolver>,
    /// Session opener.
    pub network: Arc<dyn Network>,
    /// Time source for deadlines and windows.
    pub clock: Arc<dyn Clock>,
}

/// A party taking part in flows.
pub struct Node {
    keys: KeyPair,
    address: NetworkAddress,
    services: NodeServices,
    secrets: Arc<dyn SecretSource>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: FlowConfig,
    reserved: Mutex<BTreeSet<StateRef>>,
}

impl Node {
    /// Create a node with in-memory checkpoints.
    pub fn new(
        keys: KeyPair,
        address: NetworkAddress,
        services: NodeServices,
        secrets: Arc<dyn SecretSource>,
        config: FlowConfig,
    ) -> Self {
        Self {
            keys,
            address,
            services,
            secrets,
            checkpoints: Arc::new(InMemoryCheckpoints::new()),
            config,
            reserved: Mutex::new(BTreeSet::new()),
        }
    }

    /// Replace the checkpoint store.
    pub fn with_checkpoints(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    /// This node's identity.
    pub fn party(&self) -> &Party {
        self.keys.party()
    }

    /// How peers reach this node.
    pub fn peer(&self) -> Peer {
        Peer { party: self.party().clone(), address: self.address.clone() }
    }

    pub(crate) fn keys(&self) -> &KeyPair {
        &self.keys
    }

    /// Active configuration.
    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub(crate) fn ledger(&self) -> &dyn LedgerStore {
        self.services.ledger.as_ref()
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.services.clock.as_ref()
    }

    pub(crate) fn secrets(&self) -> &dyn SecretSource {
        self.secrets.as_ref()
    }

    /// Checkpoint store backing this node's flows.
    pub fn checkpoints(&self) -> &dyn CheckpointStore {
        self.checkpoints.as_ref()
    }

    // =========================================================================
    // PLUMBING
    // =========================================================================

    /// Submit to the notary.
    pub(crate) async fn notarise(&self, stx: &SignedTransaction) -> Result<SecureHash, FlowError> {
        match self.services.notary.submit(stx).await {
            Ok(id) => {
                debug!(party = %self.party(), tx = %id.short(), "notarised");
                Ok(id)
            }
            Err(e) => {
                warn!(party = %self.party(), error = %e, "notarisation failed");
                Err(e.into())
            }
        }
    }

    /// Resolve a counterparty's proposal, run the contracts, and check
    /// every signature except ours is present.
    pub(crate) async fn verify_proposal(&self, stx: &SignedTransaction) -> Result<LedgerTransaction, FlowError> {
        let ltx = resolve_transaction(self.ledger(), &stx.tx).await?;
        ltx.verify().map_err(LedgerError::from)?;
        stx.verify_signatures_except(&[self.keys.public_key()])?;
        Ok(ltx)
    }

    /// Resolve `handle` and open a session of `kind` to it.
    pub(crate) async fn open_session(&self, handle: &str, kind: FlowKind) -> Result<FlowSession, FlowError> {
        let peer = self.resolve_peer(handle).await?;
        Ok(self.services.network.open(self.party(), &peer, kind).await?)
    }

    pub(crate) async fn resolve_peer(&self, handle: &str) -> Result<Peer, FlowError> {
        self.services
            .directory
            .resolve(handle)
            .await
            .ok_or_else(|| FlowError::IdentityNotFound(handle.to_string()))
    }

    fn reservations(&self) -> MutexGuard<'_, BTreeSet<StateRef>> {
        self.reserved.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pick unreserved spendable tokens from `issuer` covering `amount`,
    /// largest first, and reserve them.
    ///
    /// Reservations are advisory: they stop this node's own concurrent
    /// flows from picking the same tokens, nothing more.
    pub(crate) async fn select_tokens(&self, issuer: &Party, amount: u64) -> Result<Vec<StateAndRef>, FlowError> {
        let mut candidates = self.ledger().spendable_tokens(self.party(), issuer).await;
        candidates.sort_by_key(|s| std::cmp::Reverse(s.state.as_token().map_or(0, |t| t.amount)));

        let mut reserved = self.reservations();
        let mut picked = Vec::new();
        let mut total = 0u64;
        for candidate in candidates {
            if total >= amount {
                break;
            }
            if reserved.contains(&candidate.state_ref) {
                continue;
            }
            total = total.saturating_add(candidate.state.as_token().map_or(0, |t| t.amount));
            picked.push(candidate);
        }

        if total < amount {
            return Err(FlowError::InsufficientFunds { needed: amount, available: total });
        }
        reserved.extend(picked.iter().map(|s| s.state_ref));
        Ok(picked)
    }

    /// Drop reservations taken by [`Node::select_tokens`].
    pub(crate) fn unreserve(&self, refs: &[StateRef]) {
        let mut reserved = self.reservations();
        for r in refs {
            reserved.remove(r);
        }
    }

    /// Reserve specific tokens; fails if any is already reserved.
    pub(crate) fn reserve(&self, refs: &[StateRef]) -> bool {
        let mut reserved = self.reservations();
        if refs.iter().any(|r| reserved.contains(r)) {
            return false;
        }
        reserved.extend(refs.iter().copied());
        true
    }

    // =========================================================================
    // ENTRY POINTS
    // =========================================================================

    /// Issue fresh tokens, this node being the issuer.
    pub async fn issue_tokens(&self, grants: &[(Party, u64)]) -> Result<SignedTransaction, FlowError> {
        tokens::issue(self, grants).await
    }

    /// Destroy `amount` of our tokens issued by the party behind `issuer`.
    pub async fn redeem_tokens(&self, amount: u64, issuer: &str) -> Result<SignedTransaction, FlowError> {
        tokens::redeem(self, amount, issuer).await
    }

    /// Play one game against the casino behind `casino`.
    ///
    /// Failures are reported inside the outcome, never as a panic or a
    /// partial ledger change.
    #[instrument(skip(self, issuer), fields(player = %self.party()))]
    pub async fn play_game(&self, casino: &str, wager: u64, issuer: &Party) -> GameOutcome {
        let session = match self.open_session(casino, FlowKind::Play).await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "game not started");
                return GameOutcome::failed(e.to_string(), self.balance(issuer).await);
            }
        };

        let mut flow = PlayerFlow::new(self, session, wager, issuer.clone());
        match flow.run().await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, game = ?flow.game_id(), "game failed");
                GameOutcome {
                    game_id: flow.game_id(),
                    ..GameOutcome::failed(e.to_string(), self.balance(issuer).await)
                }
            }
        }
    }

    /// Recover the pot of a game whose reveal deadline has passed.
    pub async fn close_game(&self, game_id: Uuid) -> Result<SignedTransaction, FlowError> {
        play::close_game(self, game_id).await
    }

    /// Publish our unlocked total from `issuer`.
    pub async fn create_leaderboard_entry(&self, issuer: &Party) -> Result<SignedTransaction, FlowError> {
        leaderboard::create(self, issuer).await
    }

    /// Replace the entry at `entry`, ours or another player's, with our higher one.
    pub async fn overtake(&self, entry: StateRef) -> Result<SignedTransaction, FlowError> {
        leaderboard::overtake(self, entry).await
    }

    /// Withdraw our entry at `entry`.
    pub async fn retire(&self, entry: StateRef) -> Result<SignedTransaction, FlowError> {
        leaderboard::retire(self, entry).await
    }

    /// Our unlocked total from `issuer`.
    pub async fn balance(&self, issuer: &Party) -> u64 {
        self.ledger().balance(self.party(), issuer).await
    }

    /// Every live entry, highest first.
    pub async fn leaderboard(&self) -> Vec<(StateRef, LeaderboardEntry)> {
        self.ledger().leaderboard().await
    }

    // =========================================================================
    // RESPONDERS
    // =========================================================================

    /// Serve inbound sessions until the inbox closes.
    pub fn spawn_responders(self: &Arc<Self>, mut inbox: mpsc::Receiver<InboundSession>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            info!(party = %node.party(), address = %node.address, "serving inbound sessions");
            while let Some(inbound) = inbox.recv().await {
                let node = Arc::clone(&node);
                tokio::spawn(async move {
                    let session_id = inbound.session.id();
                    let from = inbound.session.counterparty().clone();
                    let result = match inbound.kind {
                        FlowKind::Play => {
                            let mut flow = CasinoFlow::new(&node, inbound.session);
                            flow.run().await.map(|_| ())
                        }
                        FlowKind::Redeem => tokens::cosign_redemption(&node, inbound.session).await,
                    };
                    match result {
                        Ok(()) => debug!(session = %session_id, from = %from, "responder finished"),
                        Err(e) => error!(session = %session_id, from = %from, error = %e, "responder failed"),
                    }
                });
            }
        })
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("party", self.party())
            .field("address", &self.address)
            .finish()
    }
}
