//! Commit/Reveal Contract
//!
//! Lifecycle of one commitment:
//!
//! ```text
//!   Commit ──► Committed ──Reveal (before deadline)──► Revealed ──Use──► settled
//!                  │
//!                  └──Close (after deadline)──► closed
//! ```
//!
//! A game groups commitments and owns the pot locked beside it. It settles
//! through Resolve when every commitment is revealed, or through Close
//! when at least one expired unrevealed. Either way the contract fixes how
//! the pot is paid out, so a lone participant may settle once the reveal
//! deadline has passed:
//!
//! - Resolve pays the first participant the derived payout and splits the
//!   rest between the others.
//! - Close splits the pot between the participants who revealed, or
//!   refunds every stake when nobody did.

use std::collections::{BTreeMap, BTreeSet};

use uuid::Uuid;

use crate::contracts::{require, signed_by, Contract, ContractError, IndexClaims};
use crate::game::payout::{derive_payout, PayoutError};
use crate::ledger::party::{Party, PublicKey};
use crate::ledger::states::{CommitImage, CommitmentState, ContractState, GameState, StateAndRef, TokenState};
use crate::ledger::transaction::{Command, CommitCommand, LedgerTransaction, TokenCommand};

/// Commit/reveal family contract.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommitContract;

impl Contract for CommitContract {
    fn verify(&self, tx: &LedgerTransaction) -> Result<(), ContractError> {
        verify_commits(tx).map_err(ContractError::Commit)
    }
}

fn verify_commits(tx: &LedgerTransaction) -> Result<(), String> {
    let mut claims = IndexClaims::default();
    let mut created_games = BTreeSet::new();

    for command in &tx.commands {
        let Command::Commit(commit_command) = &command.value else {
            continue;
        };
        let signers = command.signers.as_slice();

        match *commit_command {
            CommitCommand::Commit { output } => {
                claims.claim_output(tx, output)?;
                created_games.insert(verify_commit(tx, output, signers)?);
            }
            CommitCommand::Reveal { input, output } => {
                claims.claim_input(tx, input)?;
                claims.claim_output(tx, output)?;
                verify_reveal(tx, input, output, signers)?;
            }
            CommitCommand::Use { input } => {
                claims.claim_input(tx, input)?;
                verify_use(tx, input)?;
            }
            CommitCommand::Resolve { input } => {
                claims.claim_input(tx, input)?;
                verify_resolve(tx, input, signers)?;
            }
            CommitCommand::Close { input } => {
                claims.claim_input(tx, input)?;
                verify_close(tx, input, signers)?;
            }
        }
    }

    // Games are created by the commitments that point at them.
    require(created_games.len() <= 1, "a transaction may create at most one game")?;
    for game_output in created_games {
        claims.claim_output(tx, game_output)?;
        verify_new_game(tx, game_output)?;
    }

    claims.check_coverage(tx, ContractState::is_commit_family)
}

// =============================================================================
// COMMIT
// =============================================================================

/// Returns the output index of the game the commitment joins.
fn verify_commit(tx: &LedgerTransaction, output: usize, signers: &[PublicKey]) -> Result<usize, String> {
    let commitment = tx.outputs[output]
        .as_commitment()
        .ok_or_else(|| format!("output {} is not a commitment", output))?;

    require(signed_by(signers, &commitment.creator), "commitment creator must sign")?;

    let game_index = commitment.game.output_index as usize;
    let game = tx
        .outputs
        .get(game_index)
        .and_then(ContractState::as_game)
        .ok_or("commitment must point at a game output")?;

    require(game.id == commitment.game.game_id, "commitment points at the wrong game")?;
    require(game.commit_ids.contains(&commitment.id), "game must list the commitment")?;
    require(
        game.participants.contains(&commitment.creator),
        "commitment creator must be a game participant",
    )?;
    require(
        commitment.reveal_deadline == game.reveal_deadline,
        "commitment deadline differs from its game",
    )?;

    let unique: BTreeSet<&Uuid> = game.commit_ids.iter().collect();
    require(unique.len() == game.commit_ids.len(), "game commit ids must be unique")?;

    // Every commitment the game lists is created alongside it.
    for id in &game.commit_ids {
        let created = tx.outputs.iter().filter_map(ContractState::as_commitment).any(|c| {
            &c.id == id && c.game.game_id == game.id && c.game.output_index as usize == game_index
        });
        require(created, "every commitment of a new game must be created with it")?;
    }

    Ok(game_index)
}

/// A new game records its stakes and is created beside the one pot
/// holding them.
fn verify_new_game(tx: &LedgerTransaction, index: usize) -> Result<(), String> {
    let game = tx.outputs[index]
        .as_game()
        .ok_or_else(|| format!("output {} is not a game", index))?;

    require(game.participants.len() >= 2, "a game needs at least two participants")?;
    let unique: BTreeSet<&Party> = game.participants.iter().collect();
    require(unique.len() == game.participants.len(), "game participants must be distinct")?;
    require(
        game.stakes.len() == game.participants.len(),
        "game must record one stake per participant",
    )?;
    require(game.paytable.modulus > 0, "game paytable modulus must be positive")?;
    let staked = game.pot().ok_or("game stakes overflow")?;

    let pots: Vec<&TokenState> = tx
        .outputs
        .iter()
        .filter_map(ContractState::as_token)
        .filter(|t| t.locked)
        .collect();
    require(pots.len() == 1, "a game transaction must lock exactly one pot")?;
    let pot = pots[0];
    let holders: BTreeSet<&Party> = pot.participants.iter().collect();
    require(
        holders == unique && pot.participants.len() == game.participants.len(),
        "pot must be held by the game participants",
    )?;
    require(pot.amount == staked, "pot must hold the recorded stakes")?;
    require(staked >= game.paytable.max_payout(), "pot must cover the top payout")
}

// =============================================================================
// REVEAL
// =============================================================================

fn verify_reveal(
    tx: &LedgerTransaction,
    input: usize,
    output: usize,
    signers: &[PublicKey],
) -> Result<(), String> {
    let consumed = &tx.inputs[input];
    let commitment = consumed
        .state
        .as_commitment()
        .ok_or_else(|| format!("input {} is not a commitment", input))?;
    let revealed = tx.outputs[output]
        .as_revealed()
        .ok_or_else(|| format!("output {} is not a revealed image", output))?;

    require(
        revealed.image.hash() == commitment.hash,
        "revealed image does not match the commitment hash",
    )?;
    require(revealed.creator == commitment.creator, "reveal must keep the creator")?;
    require(revealed.id == commitment.id, "reveal must keep the commitment id")?;
    require(revealed.game == commitment.game, "reveal must keep the game pointer")?;

    // The game lives next to the commitment in the transaction that created both.
    let game_ref = commitment.game.resolve(consumed.state_ref.txhash);
    let game = tx
        .references
        .iter()
        .find(|r| r.state_ref == game_ref)
        .and_then(|r| r.state.as_game())
        .ok_or("reveal must reference its game")?;
    require(game.id == commitment.game.game_id, "reveal references the wrong game")?;
    require(game.commit_ids.contains(&commitment.id), "game does not list the commitment")?;

    require(
        game.participants.iter().any(|p| signed_by(signers, p)),
        "a game participant must sign the reveal",
    )?;

    let until = tx
        .time_window
        .and_then(|w| w.until)
        .ok_or("reveal needs a time window with an upper bound")?;
    require(until <= commitment.reveal_deadline, "reveal is past the commitment deadline")
}

// =============================================================================
// SETTLEMENT
// =============================================================================

fn verify_use(tx: &LedgerTransaction, input: usize) -> Result<(), String> {
    let revealed = tx.inputs[input]
        .state
        .as_revealed()
        .ok_or_else(|| format!("input {} is not a revealed image", input))?;

    require(
        input_game(tx, revealed.game.game_id).is_some(),
        "revealed images can only be used together with their game",
    )
}

fn verify_resolve(tx: &LedgerTransaction, input: usize, signers: &[PublicKey]) -> Result<(), String> {
    let consumed = &tx.inputs[input];
    let game = consumed
        .state
        .as_game()
        .ok_or_else(|| format!("input {} is not a game", input))?;

    let mut images = Vec::with_capacity(game.commit_ids.len());
    for id in &game.commit_ids {
        let revealed = tx
            .inputs
            .iter()
            .filter_map(|s| s.state.as_revealed())
            .find(|r| &r.id == id && r.game.game_id == game.id)
            .ok_or("every commitment must be revealed to resolve the game")?;
        images.push(revealed.image);
    }

    let everyone = game.participants.iter().all(|p| signed_by(signers, p));
    let Some(release) = pot_release(tx, consumed, game)? else {
        return require(everyone, "all game participants must sign resolution");
    };
    if !everyone {
        require(
            game.participants.iter().any(|p| signed_by(signers, p)),
            "a game participant must sign resolution",
        )?;
        require(
            after_deadline(tx, game),
            "all game participants must sign resolution before the reveal deadline",
        )?;
    }

    let shares = resolution_shares(game, release.amount, &images).map_err(|e| e.to_string())?;
    release.require_pays(&shares)
}

// =============================================================================
// CLOSE
// =============================================================================

fn verify_close(tx: &LedgerTransaction, input: usize, signers: &[PublicKey]) -> Result<(), String> {
    let consumed = &tx.inputs[input];
    match &consumed.state {
        ContractState::Commitment(commitment) => close_commitment(tx, commitment, signers),
        ContractState::Game(game) => close_game(tx, consumed, game, signers),
        _ => Err(format!("input {} is neither a commitment nor a game", input)),
    }
}

fn close_commitment(
    tx: &LedgerTransaction,
    commitment: &CommitmentState,
    signers: &[PublicKey],
) -> Result<(), String> {
    let from = tx
        .time_window
        .and_then(|w| w.from)
        .ok_or("close needs a time window with a lower bound")?;
    require(
        from > commitment.reveal_deadline,
        "close must be strictly after the reveal deadline",
    )?;

    let participants: Vec<&Party> = input_game(tx, commitment.game.game_id)
        .or_else(|| reference_game(tx, commitment.game.game_id))
        .map(|g| g.participants.iter().collect())
        .unwrap_or_default();

    require(
        signed_by(signers, &commitment.creator) || participants.iter().any(|p| signed_by(signers, p)),
        "close must be signed by the creator or a game participant",
    )
}

fn close_game(
    tx: &LedgerTransaction,
    consumed: &StateAndRef,
    game: &GameState,
    signers: &[PublicKey],
) -> Result<(), String> {
    require(
        game.participants.iter().any(|p| signed_by(signers, p)),
        "a game participant must sign the close",
    )?;

    let mut closed_any = false;
    let mut revealers = Vec::new();
    for id in &game.commit_ids {
        let closed = closed_commitment_inputs(tx).any(|c| &c.id == id && c.game.game_id == game.id);
        let revealed = tx
            .inputs
            .iter()
            .filter_map(|s| s.state.as_revealed())
            .find(|r| &r.id == id && r.game.game_id == game.id);
        require(
            closed || revealed.is_some(),
            "every commitment of a closed game must be closed or revealed",
        )?;
        closed_any |= closed;
        revealers.extend(revealed.map(|r| &r.creator));
    }
    require(closed_any, "a fully revealed game must be resolved, not closed")?;

    match pot_release(tx, consumed, game)? {
        Some(release) => release.require_pays(&close_shares(game, release.amount, &revealers)),
        None => require(
            game.participants.iter().all(|p| signed_by(signers, p)),
            "all game participants must sign a close that leaves the pot locked",
        ),
    }
}

// =============================================================================
// POT PAYOUT
// =============================================================================

/// How the pot of a fully revealed game is paid out.
///
/// The first participant receives the payout `images` derive from the
/// game's table, capped at the pot; the other participants split the rest.
pub fn resolution_shares(
    game: &GameState,
    pot: u64,
    images: &[CommitImage],
) -> Result<Vec<(Party, u64)>, PayoutError> {
    let payout = derive_payout(images, &game.paytable)?.min(pot);
    let Some((player, house)) = game.participants.split_first() else {
        return Ok(Vec::new());
    };
    let house: Vec<&Party> = house.iter().collect();
    let mut shares = vec![(player.clone(), payout)];
    shares.extend(split_evenly(pot - payout, &house));
    Ok(shares)
}

/// How the pot of a closed game is paid out.
///
/// Participants who revealed split the pot; whoever withheld its image
/// forfeits its stake. When nobody revealed, every stake is refunded.
pub fn close_shares(game: &GameState, pot: u64, revealers: &[&Party]) -> Vec<(Party, u64)> {
    let winners: Vec<&Party> = game.participants.iter().filter(|p| revealers.contains(p)).collect();
    if winners.is_empty() {
        return game
            .participants
            .iter()
            .cloned()
            .zip(game.stakes.iter().copied())
            .collect();
    }
    split_evenly(pot, &winners)
}

/// Equal shares; the remainder goes to the first party.
fn split_evenly(amount: u64, parties: &[&Party]) -> Vec<(Party, u64)> {
    let count = parties.len() as u64;
    if count == 0 {
        return Vec::new();
    }
    let (each, remainder) = (amount / count, amount % count);
    parties
        .iter()
        .enumerate()
        .map(|(i, p)| ((*p).clone(), if i == 0 { each + remainder } else { each }))
        .collect()
}

/// A game's pot as released in the settling transaction.
struct PotRelease<'a> {
    amount: u64,
    outputs: Vec<&'a TokenState>,
}

impl PotRelease<'_> {
    fn require_pays(&self, shares: &[(Party, u64)]) -> Result<(), String> {
        let mut paid: BTreeMap<&Party, u64> = BTreeMap::new();
        for token in &self.outputs {
            let holder = token
                .holder
                .as_ref()
                .filter(|_| !token.locked)
                .ok_or("a settled pot must be paid out unlocked")?;
            let entry = paid.entry(holder).or_default();
            *entry = entry.saturating_add(token.amount);
        }
        let expected: BTreeMap<&Party, u64> = shares
            .iter()
            .filter(|(_, amount)| *amount > 0)
            .map(|(party, amount)| (party, *amount))
            .collect();
        require(paid == expected, "pot payout does not match the game outcome")
    }
}

/// The pot locked beside `game`, if this transaction consumes it, with
/// the outputs of its release.
fn pot_release<'a>(
    tx: &'a LedgerTransaction,
    game_ref: &StateAndRef,
    game: &GameState,
) -> Result<Option<PotRelease<'a>>, String> {
    let Some((index, pot)) = tx.inputs.iter().enumerate().find_map(|(i, s)| {
        s.state
            .as_token()
            .filter(|t| t.locked && s.state_ref.txhash == game_ref.state_ref.txhash)
            .map(|t| (i, t))
    }) else {
        return Ok(None);
    };

    let (inputs, outputs) = tx
        .commands
        .iter()
        .find_map(|c| match &c.value {
            Command::Token(TokenCommand::Release { inputs, outputs }) if inputs.contains(&index) => {
                Some((inputs, outputs))
            }
            _ => None,
        })
        .ok_or_else(|| format!("the pot of game {} must be released when it settles", game.id))?;
    require(inputs.len() == 1, "the pot of a settled game must be released on its own")?;

    let outputs = outputs
        .iter()
        .map(|&i| {
            tx.outputs
                .get(i)
                .and_then(ContractState::as_token)
                .ok_or_else(|| format!("release output {} is not a token", i))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(PotRelease { amount: pot.amount, outputs }))
}

fn after_deadline(tx: &LedgerTransaction, game: &GameState) -> bool {
    tx.time_window
        .and_then(|w| w.from)
        .is_some_and(|from| from > game.reveal_deadline)
}

// =============================================================================
// HELPERS
// =============================================================================

fn find_game(states: &[StateAndRef], game_id: Uuid) -> Option<&GameState> {
    states
        .iter()
        .filter_map(|s| s.state.as_game())
        .find(|g| g.id == game_id)
}

fn input_game(tx: &LedgerTransaction, game_id: Uuid) -> Option<&GameState> {
    find_game(&tx.inputs, game_id)
}

fn reference_game(tx: &LedgerTransaction, game_id: Uuid) -> Option<&GameState> {
    find_game(&tx.references, game_id)
}

/// Commitment inputs consumed by a Close command.
fn closed_commitment_inputs(tx: &LedgerTransaction) -> impl Iterator<Item = &CommitmentState> {
    tx.commands
        .iter()
        .filter_map(|c| match c.value {
            Command::Commit(CommitCommand::Close { input }) => tx.inputs.get(input),
            _ => None,
        })
        .filter_map(|s| s.state.as_commitment())
}
