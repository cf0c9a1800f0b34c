//! Ledger Records
//!
//! Immutable, consumed-once records. A transaction consumes existing
//! records by [`StateRef`] and produces new ones; nothing is ever edited
//! in place.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::hash::{DigestBuilder, SecureHash, COMMIT_DOMAIN};
use crate::core::rng::SecretSource;
use crate::game::payout::PayoutTable;
use crate::ledger::party::Party;

// =============================================================================
// REFERENCES
// =============================================================================

/// Pointer to an output of a committed transaction.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateRef {
    /// Id of the transaction that produced the record.
    pub txhash: SecureHash,
    /// Output index within that transaction.
    pub index: u32,
}

impl StateRef {
    /// Create a new reference.
    pub const fn new(txhash: SecureHash, index: u32) -> Self {
        Self { txhash, index }
    }
}

impl fmt::Display for StateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txhash.short(), self.index)
    }
}

impl fmt::Debug for StateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateRef({})", self)
    }
}

/// A resolved record together with where it lives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateAndRef {
    /// The record.
    pub state: ContractState,
    /// Its location.
    pub state_ref: StateRef,
}

// =============================================================================
// TOKENS
// =============================================================================

/// Fungible token issued by `issuer`.
///
/// A locked token has no individual holder; it belongs jointly to
/// `participants`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenState {
    /// Individual holder, `None` while locked.
    pub holder: Option<Party>,
    /// Locked into a game pot.
    pub locked: bool,
    /// Party that issued (and can redeem) the token.
    pub issuer: Party,
    /// Quantity.
    pub amount: u64,
    /// Parties with custody: `[holder]` when unlocked, the joint set when locked.
    pub participants: Vec<Party>,
}

impl TokenState {
    /// Unlocked token held by `holder`.
    pub fn unlocked(holder: Party, issuer: Party, amount: u64) -> Self {
        Self {
            holder: Some(holder.clone()),
            locked: false,
            issuer,
            amount,
            participants: vec![holder],
        }
    }

    /// Locked token held jointly by `participants`.
    pub fn locked(participants: Vec<Party>, issuer: Party, amount: u64) -> Self {
        Self {
            holder: None,
            locked: true,
            issuer,
            amount,
            participants,
        }
    }

    /// `locked` iff no holder.
    pub fn is_well_formed(&self) -> bool {
        self.locked == self.holder.is_none()
    }

    /// Unlocked and held by `party`, issued by `issuer`.
    pub fn is_spendable_by(&self, party: &Party, issuer: &Party) -> bool {
        !self.locked && self.holder.as_ref() == Some(party) && &self.issuer == issuer
    }
}

// =============================================================================
// COMMIT / REVEAL
// =============================================================================

/// Secret picked by one party: a value and a blinding salt.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitImage {
    /// Picked value.
    pub picked: i64,
    /// Blinding salt.
    pub salt: i64,
}

impl CommitImage {
    /// Create from raw parts.
    pub const fn new(picked: i64, salt: i64) -> Self {
        Self { picked, salt }
    }

    /// Draw a fresh image.
    pub fn random(source: &dyn SecretSource) -> Self {
        Self {
            picked: source.next_i64(),
            salt: source.next_i64(),
        }
    }

    /// Fixed 16-byte encoding: picked then salt, both big-endian.
    pub fn encode(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.picked.to_be_bytes());
        out[8..].copy_from_slice(&self.salt.to_be_bytes());
        out
    }

    /// Commitment hash of this image.
    pub fn hash(&self) -> SecureHash {
        let mut builder = DigestBuilder::new(COMMIT_DOMAIN);
        builder.update_bytes(&self.encode());
        builder.finalize()
    }
}

impl fmt::Debug for CommitImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Secrets stay out of logs.
        write!(f, "CommitImage({})", self.hash().short())
    }
}

/// Foreign key from a commitment to its game.
///
/// `output_index` is the game's position in the transaction that created
/// both records, so the game's `StateRef` is recoverable from the
/// commitment's own `StateRef`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GamePointer {
    /// Game id.
    pub game_id: Uuid,
    /// Output index of the game in its creating transaction.
    pub output_index: u32,
}

impl GamePointer {
    /// Game location, given the transaction that created it.
    pub fn resolve(&self, creating_tx: SecureHash) -> StateRef {
        StateRef::new(creating_tx, self.output_index)
    }
}

/// Hidden commitment to a [`CommitImage`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentState {
    /// Hash of the committed image.
    pub hash: SecureHash,
    /// Committing party.
    pub creator: Party,
    /// Last instant a reveal is accepted.
    pub reveal_deadline: DateTime<Utc>,
    /// Owning game.
    pub game: GamePointer,
    /// Unique id, inherited by the reveal.
    pub id: Uuid,
}

/// Disclosed image replacing a commitment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealedState {
    /// Disclosed secret.
    pub image: CommitImage,
    /// Committing party.
    pub creator: Party,
    /// Owning game.
    pub game: GamePointer,
    /// Id of the commitment this reveals.
    pub id: Uuid,
}

impl RevealedState {
    /// Reveal `image` against `commitment`, keeping creator, game and id.
    pub fn from_commitment(commitment: &CommitmentState, image: CommitImage) -> Self {
        Self {
            image,
            creator: commitment.creator.clone(),
            game: commitment.game,
            id: commitment.id,
        }
    }
}

/// Ties a set of commitments together so they settle as one.
///
/// The game also fixes how its pot may be paid out: the first participant
/// is the player and receives the payout derived from `paytable`; the
/// others share the rest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameState {
    /// Commitments that must all be revealed to resolve.
    pub commit_ids: Vec<Uuid>,
    /// Parties in the game, player first.
    pub participants: Vec<Party>,
    /// Game id.
    pub id: Uuid,
    /// What each participant locked into the pot, in participant order.
    pub stakes: Vec<u64>,
    /// Shared reveal deadline of every commitment in the game.
    pub reveal_deadline: DateTime<Utc>,
    /// Table the payout is derived from.
    pub paytable: PayoutTable,
}

impl GameState {
    /// Total locked into the pot, `None` on overflow.
    pub fn pot(&self) -> Option<u64> {
        self.stakes.iter().try_fold(0u64, |acc, s| acc.checked_add(*s))
    }
}

// =============================================================================
// LEADERBOARD
// =============================================================================

/// Provable claim of a player's token total.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    /// Ranked player.
    pub player: Party,
    /// Claimed total of unlocked tokens.
    pub total: u64,
    /// Issuer of the counted tokens.
    pub token_issuer: Party,
    /// When the claim was made.
    pub creation: DateTime<Utc>,
    /// Entry id.
    pub id: Uuid,
}

// =============================================================================
// CLOSED STATE ENUM
// =============================================================================

/// Every record family the ledger knows.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractState {
    /// Token family.
    Token(TokenState),
    /// Commit family: pending commitment.
    Commitment(CommitmentState),
    /// Commit family: revealed image.
    Revealed(RevealedState),
    /// Commit family: game linking commitments.
    Game(GameState),
    /// Leaderboard family.
    Leaderboard(LeaderboardEntry),
}

impl ContractState {
    /// Parties that track this record.
    pub fn participants(&self) -> Vec<Party> {
        match self {
            Self::Token(t) => t.participants.clone(),
            Self::Commitment(c) => vec![c.creator.clone()],
            Self::Revealed(r) => vec![r.creator.clone()],
            Self::Game(g) => g.participants.clone(),
            Self::Leaderboard(e) => vec![e.player.clone()],
        }
    }

    /// Token view.
    pub fn as_token(&self) -> Option<&TokenState> {
        match self {
            Self::Token(t) => Some(t),
            _ => None,
        }
    }

    /// Commitment view.
    pub fn as_commitment(&self) -> Option<&CommitmentState> {
        match self {
            Self::Commitment(c) => Some(c),
            _ => None,
        }
    }

    /// Revealed view.
    pub fn as_revealed(&self) -> Option<&RevealedState> {
        match self {
            Self::Revealed(r) => Some(r),
            _ => None,
        }
    }

    /// Game view.
    pub fn as_game(&self) -> Option<&GameState> {
        match self {
            Self::Game(g) => Some(g),
            _ => None,
        }
    }

    /// Leaderboard view.
    pub fn as_leaderboard(&self) -> Option<&LeaderboardEntry> {
        match self {
            Self::Leaderboard(e) => Some(e),
            _ => None,
        }
    }

    /// Belongs to the commit/reveal family.
    pub fn is_commit_family(&self) -> bool {
        matches!(self, Self::Commitment(_) | Self::Revealed(_) | Self::Game(_))
    }
}

impl From<TokenState> for ContractState {
    fn from(t: TokenState) -> Self {
        Self::Token(t)
    }
}

impl From<CommitmentState> for ContractState {
    fn from(c: CommitmentState) -> Self {
        Self::Commitment(c)
    }
}

impl From<RevealedState> for ContractState {
    fn from(r: RevealedState) -> Self {
        Self::Revealed(r)
    }
}

impl From<GameState> for ContractState {
    fn from(g: GameState) -> Self {
        Self::Game(g)
    }
}

impl From<LeaderboardEntry> for ContractState {
    fn from(e: LeaderboardEntry) -> Self {
        Self::Leaderboard(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rng::SeededSecretSource;
    use crate::ledger::party::KeyPair;

    #[test]
    fn test_image_encoding_layout() {
        let image = CommitImage::new(1, -1);
        let bytes = image.encode();
        assert_eq!(&bytes[..8], &[0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(&bytes[8..], &[0xFF; 8]);
    }

    #[test]
    fn test_image_hash_binds_both_parts() {
        let image = CommitImage::new(42, 7);
        assert_eq!(image.hash(), CommitImage::new(42, 7).hash());
        assert_ne!(image.hash(), CommitImage::new(42, 8).hash());
        assert_ne!(image.hash(), CommitImage::new(43, 7).hash());
    }

    #[test]
    fn test_token_well_formed() {
        let source = SeededSecretSource::new(1);
        let alice = KeyPair::generate("alice", &source).party().clone();
        let bank = KeyPair::generate("bank", &source).party().clone();

        let free = TokenState::unlocked(alice.clone(), bank.clone(), 5);
        assert!(free.is_well_formed());
        assert!(free.is_spendable_by(&alice, &bank));

        let locked = TokenState::locked(vec![alice.clone()], bank.clone(), 5);
        assert!(locked.is_well_formed());
        assert!(!locked.is_spendable_by(&alice, &bank));

        let mut broken = locked;
        broken.holder = Some(alice);
        assert!(!broken.is_well_formed());
    }

    #[test]
    fn test_reveal_inherits_identity() {
        let source = SeededSecretSource::new(2);
        let alice = KeyPair::generate("alice", &source).party().clone();
        let image = CommitImage::random(&source);
        let commitment = CommitmentState {
            hash: image.hash(),
            creator: alice,
            reveal_deadline: Utc::now(),
            game: GamePointer { game_id: Uuid::new_v4(), output_index: 3 },
            id: Uuid::new_v4(),
        };

        let revealed = RevealedState::from_commitment(&commitment, image);
        assert_eq!(revealed.id, commitment.id);
        assert_eq!(revealed.game, commitment.game);
        assert_eq!(revealed.creator, commitment.creator);
    }
}
