//! Token Contract
//!
//! Conservation rules for issuing, locking, releasing and redeeming
//! tokens. Value is created only by Issue and destroyed only by Redeem;
//! Lock and Release move value between the locked and unlocked forms
//! without changing the total.
//!
//! A locked token is in joint custody: moving it needs every participant,
//! except when its game settles in the same transaction and the commit
//! contract fixes the payout.

use std::collections::BTreeSet;

use crate::contracts::{require, signed_by, Contract, ContractError, IndexClaims};
use crate::ledger::party::{Party, PublicKey};
use crate::ledger::states::{ContractState, StateAndRef, TokenState};
use crate::ledger::transaction::{Command, CommitCommand, LedgerTransaction, TokenCommand};

/// Token family contract.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenContract;

impl Contract for TokenContract {
    fn verify(&self, tx: &LedgerTransaction) -> Result<(), ContractError> {
        verify_tokens(tx).map_err(ContractError::Token)
    }
}

fn verify_tokens(tx: &LedgerTransaction) -> Result<(), String> {
    let mut claims = IndexClaims::default();

    for command in &tx.commands {
        let Command::Token(token_command) = &command.value else {
            continue;
        };
        let signers = command.signers.as_slice();

        match token_command {
            TokenCommand::Issue { outputs } => {
                claims.claim_outputs(tx, outputs)?;
                verify_issue(tx, outputs, signers)?;
            }
            TokenCommand::Lock { inputs, outputs } => {
                claims.claim_inputs(tx, inputs)?;
                claims.claim_outputs(tx, outputs)?;
                verify_lock(tx, inputs, outputs, signers)?;
            }
            TokenCommand::Release { inputs, outputs } => {
                claims.claim_inputs(tx, inputs)?;
                claims.claim_outputs(tx, outputs)?;
                verify_release(tx, inputs, outputs, signers)?;
            }
            TokenCommand::Redeem { inputs, outputs } => {
                claims.claim_inputs(tx, inputs)?;
                claims.claim_outputs(tx, outputs)?;
                verify_redeem(tx, inputs, outputs, signers)?;
            }
        }
    }

    claims.check_coverage(tx, |s| matches!(s, ContractState::Token(_)))?;

    for output in tx.outputs.iter().filter_map(ContractState::as_token) {
        require(output.is_well_formed(), "locked tokens must have no holder and unlocked tokens one")?;
        require(output.amount > 0, "token outputs must have a positive amount")?;
    }
    Ok(())
}

// =============================================================================
// COMMANDS
// =============================================================================

fn verify_issue(tx: &LedgerTransaction, outputs: &[usize], signers: &[PublicKey]) -> Result<(), String> {
    require(!outputs.is_empty(), "issue must produce tokens")?;
    let outs = token_outputs(tx, outputs)?;

    let issuer = single_issuer(&outs, "issued tokens must share one issuer")?;
    require(outs.iter().all(|t| !t.locked), "issued tokens must be unlocked")?;
    require(outs.iter().all(|t| t.amount > 0), "issued amounts must be positive")?;
    require(signed_by(signers, issuer), "issuer must sign issuance")
}

fn verify_lock(
    tx: &LedgerTransaction,
    inputs: &[usize],
    outputs: &[usize],
    signers: &[PublicKey],
) -> Result<(), String> {
    let ins = token_inputs(tx, inputs)?;
    let outs = token_outputs(tx, outputs)?;

    let all: Vec<&TokenState> = ins.iter().chain(outs.iter()).copied().collect();
    single_issuer(&all, "lock inputs and outputs must share one issuer")?;

    require(ins.iter().any(|t| !t.locked), "lock needs at least one unlocked input")?;
    require(outs.iter().any(|t| t.locked), "lock needs at least one locked output")?;
    require(total(&ins) == total(&outs), "lock must conserve the total amount")?;
    require(locked_total(&outs) > locked_total(&ins), "locked sums must increase")?;
    require_holders_signed(&ins, signers)?;

    for t in ins.iter().filter(|t| t.locked) {
        require(
            t.participants.iter().all(|p| signed_by(signers, p)),
            "every participant of a locked input must sign lock",
        )?;
    }
    Ok(())
}

fn verify_release(
    tx: &LedgerTransaction,
    inputs: &[usize],
    outputs: &[usize],
    signers: &[PublicKey],
) -> Result<(), String> {
    let ins = token_inputs(tx, inputs)?;
    let outs = token_outputs(tx, outputs)?;

    let all: Vec<&TokenState> = ins.iter().chain(outs.iter()).copied().collect();
    single_issuer(&all, "release inputs and outputs must share one issuer")?;

    require(total(&ins) == total(&outs), "release must conserve the total amount")?;
    require(locked_total(&outs) < locked_total(&ins), "locked sums must decrease")?;
    require_holders_signed(&ins, signers)?;

    for &i in inputs {
        let consumed = &tx.inputs[i];
        let Some(pot) = consumed.state.as_token().filter(|t| t.locked) else {
            continue;
        };
        if settled_with_game(tx, consumed) {
            continue;
        }
        require(
            pot.participants.iter().all(|p| signed_by(signers, p)),
            "every participant of a locked input must sign release",
        )?;
    }
    Ok(())
}

fn verify_redeem(
    tx: &LedgerTransaction,
    inputs: &[usize],
    outputs: &[usize],
    signers: &[PublicKey],
) -> Result<(), String> {
    require(!inputs.is_empty(), "redeem must consume tokens")?;
    let ins = token_inputs(tx, inputs)?;
    let outs = token_outputs(tx, outputs)?;

    require(ins.iter().all(|t| !t.locked), "redeemed tokens must be unlocked")?;
    let issuer = single_issuer(&ins, "redeemed tokens must share one issuer")?;

    require(outs.iter().all(|t| !t.locked), "redeem change must be unlocked")?;
    require(
        outs.iter().all(|t| &t.issuer == issuer),
        "redeem change must keep the redeemed issuer",
    )?;

    let before = total(&ins);
    let after = total(&outs);
    if before == 0 {
        require(after == 0, "redeeming empty tokens cannot produce value")?;
    } else {
        require(after < before, "redeem must reduce the total amount")?;
    }

    require_holders_signed(&ins, signers)?;
    require(signed_by(signers, issuer), "issuer must sign redemption")
}

// =============================================================================
// HELPERS
// =============================================================================

fn token_inputs<'a>(tx: &'a LedgerTransaction, indices: &[usize]) -> Result<Vec<&'a TokenState>, String> {
    indices
        .iter()
        .map(|&i| {
            tx.inputs[i]
                .state
                .as_token()
                .ok_or_else(|| format!("input {} is not a token", i))
        })
        .collect()
}

fn token_outputs<'a>(tx: &'a LedgerTransaction, indices: &[usize]) -> Result<Vec<&'a TokenState>, String> {
    indices
        .iter()
        .map(|&i| {
            tx.outputs[i]
                .as_token()
                .ok_or_else(|| format!("output {} is not a token", i))
        })
        .collect()
}

/// The one issuer shared by `tokens`.
fn single_issuer<'a>(tokens: &[&'a TokenState], reason: &str) -> Result<&'a Party, String> {
    let issuers: BTreeSet<&Party> = tokens.iter().map(|t| &t.issuer).collect();
    require(issuers.len() == 1, reason)?;
    issuers.into_iter().next().ok_or_else(|| reason.to_string())
}

fn total(tokens: &[&TokenState]) -> u128 {
    tokens.iter().map(|t| t.amount as u128).sum()
}

fn locked_total(tokens: &[&TokenState]) -> u128 {
    tokens.iter().filter(|t| t.locked).map(|t| t.amount as u128).sum()
}

/// A Resolve or Close in `tx` consumes the game created beside `pot`.
fn settled_with_game(tx: &LedgerTransaction, pot: &StateAndRef) -> bool {
    tx.commands.iter().any(|c| match c.value {
        Command::Commit(CommitCommand::Resolve { input } | CommitCommand::Close { input }) => tx
            .inputs
            .get(input)
            .is_some_and(|g| g.state.as_game().is_some() && g.state_ref.txhash == pot.state_ref.txhash),
        _ => false,
    })
}

fn require_holders_signed(inputs: &[&TokenState], signers: &[PublicKey]) -> Result<(), String> {
    for holder in inputs.iter().filter_map(|t| t.holder.as_ref()) {
        require(
            signed_by(signers, holder),
            format!("holder {} must sign", holder.name),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::testing::{Cast, TxFixture};
    use crate::core::hash::SecureHash;
    use crate::game::payout::PayoutTable;
    use crate::ledger::states::{GameState, StateRef};
    use chrono::Utc;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn unlocked(holder: &Party, issuer: &Party, amount: u64) -> TokenState {
        TokenState::unlocked(holder.clone(), issuer.clone(), amount)
    }

    fn locked(cast: &Cast, amount: u64) -> TokenState {
        TokenState::locked(
            vec![cast.casino.party().clone(), cast.player.party().clone()],
            cast.bank.party().clone(),
            amount,
        )
    }

    fn reason(fx: &TxFixture) -> String {
        TokenContract.verify(&fx.build()).unwrap_err().reason().to_string()
    }

    /// Casino 400 + player 3 locked into one pot.
    fn lock_fixture(cast: &Cast) -> TxFixture {
        let bank = cast.bank.party();
        let mut fx = TxFixture::new();
        let a = fx.input(unlocked(cast.casino.party(), bank, 400));
        let b = fx.input(unlocked(cast.player.party(), bank, 3));
        let o = fx.output(locked(cast, 403));
        fx.command(
            TokenCommand::Lock { inputs: vec![a, b], outputs: vec![o] },
            &[&cast.casino, &cast.player],
        );
        fx
    }

    #[test]
    fn test_issue_valid() {
        let cast = Cast::new();
        let bank = cast.bank.party();
        let mut fx = TxFixture::new();
        let a = fx.output(unlocked(cast.casino.party(), bank, 400));
        let b = fx.output(unlocked(cast.player.party(), bank, 3));
        fx.command(TokenCommand::Issue { outputs: vec![a, b] }, &[&cast.bank]);
        assert!(TokenContract.verify(&fx.build()).is_ok());
    }

    #[test]
    fn test_issue_requires_issuer_signature() {
        let cast = Cast::new();
        let mut fx = TxFixture::new();
        let a = fx.output(unlocked(cast.player.party(), cast.bank.party(), 3));
        fx.command(TokenCommand::Issue { outputs: vec![a] }, &[&cast.player]);
        assert_eq!(reason(&fx), "issuer must sign issuance");
    }

    #[test]
    fn test_issue_rejects_mixed_issuers() {
        let cast = Cast::new();
        let mut fx = TxFixture::new();
        let a = fx.output(unlocked(cast.player.party(), cast.bank.party(), 3));
        let b = fx.output(unlocked(cast.player.party(), cast.casino.party(), 3));
        fx.command(TokenCommand::Issue { outputs: vec![a, b] }, &[&cast.bank, &cast.casino]);
        assert_eq!(reason(&fx), "issued tokens must share one issuer");
    }

    #[test]
    fn test_issue_rejects_locked_and_zero() {
        let cast = Cast::new();
        let mut fx = TxFixture::new();
        let a = fx.output(locked(&cast, 3));
        fx.command(TokenCommand::Issue { outputs: vec![a] }, &[&cast.bank]);
        assert_eq!(reason(&fx), "issued tokens must be unlocked");

        let mut fx = TxFixture::new();
        let a = fx.output(unlocked(cast.player.party(), cast.bank.party(), 0));
        fx.command(TokenCommand::Issue { outputs: vec![a] }, &[&cast.bank]);
        assert_eq!(reason(&fx), "issued amounts must be positive");
    }

    #[test]
    fn test_lock_valid() {
        let cast = Cast::new();
        assert!(TokenContract.verify(&lock_fixture(&cast).build()).is_ok());
    }

    #[test]
    fn test_lock_with_change() {
        let cast = Cast::new();
        let bank = cast.bank.party();
        let mut fx = TxFixture::new();
        let a = fx.input(unlocked(cast.player.party(), bank, 10));
        let o = fx.output(locked(&cast, 4));
        let c = fx.output(unlocked(cast.player.party(), bank, 6));
        fx.command(TokenCommand::Lock { inputs: vec![a], outputs: vec![o, c] }, &[&cast.player]);
        assert!(TokenContract.verify(&fx.build()).is_ok());
    }

    #[test]
    fn test_lock_requires_holder_signatures() {
        let cast = Cast::new();
        let mut fx = lock_fixture(&cast);
        fx.commands[0].signers = vec![cast.casino.public_key()];
        assert_eq!(reason(&fx), "holder player must sign");
    }

    #[test]
    fn test_lock_must_conserve() {
        let cast = Cast::new();
        let mut fx = lock_fixture(&cast);
        fx.outputs[0] = locked(&cast, 404).into();
        assert_eq!(reason(&fx), "lock must conserve the total amount");
    }

    #[test]
    fn test_lock_must_increase_locked_sum() {
        let cast = Cast::new();
        let bank = cast.bank.party();
        let mut fx = TxFixture::new();
        let a = fx.input(locked(&cast, 5));
        let b = fx.input(unlocked(cast.player.party(), bank, 5));
        let o = fx.output(locked(&cast, 5));
        let c = fx.output(unlocked(cast.player.party(), bank, 5));
        fx.command(TokenCommand::Lock { inputs: vec![a, b], outputs: vec![o, c] }, &[&cast.player]);
        assert_eq!(reason(&fx), "locked sums must increase");
    }

    #[test]
    fn test_lock_rejects_foreign_issuer() {
        let cast = Cast::new();
        let mut fx = lock_fixture(&cast);
        fx.inputs[1].state = unlocked(cast.player.party(), cast.casino.party(), 3).into();
        assert_eq!(reason(&fx), "lock inputs and outputs must share one issuer");
    }

    /// Pot of 403 split 17 / 386.
    fn release_fixture(cast: &Cast) -> TxFixture {
        let bank = cast.bank.party();
        let mut fx = TxFixture::new();
        let a = fx.input(locked(cast, 403));
        let p = fx.output(unlocked(cast.player.party(), bank, 17));
        let c = fx.output(unlocked(cast.casino.party(), bank, 386));
        fx.command(
            TokenCommand::Release { inputs: vec![a], outputs: vec![p, c] },
            &[&cast.player, &cast.casino],
        );
        fx
    }

    #[test]
    fn test_release_valid() {
        let cast = Cast::new();
        assert!(TokenContract.verify(&release_fixture(&cast).build()).is_ok());
    }

    #[test]
    fn test_release_by_lone_participant_rejected() {
        let cast = Cast::new();
        let mut fx = release_fixture(&cast);

        // The player alone cannot walk away with the joint pot.
        fx.outputs[0] = unlocked(cast.player.party(), cast.bank.party(), 403).into();
        fx.outputs.truncate(1);
        fx.commands[0].value = Command::Token(TokenCommand::Release { inputs: vec![0], outputs: vec![0] });
        fx.commands[0].signers = vec![cast.player.public_key()];
        assert_eq!(reason(&fx), "every participant of a locked input must sign release");

        fx.commands[0].signers = vec![cast.bank.public_key()];
        assert_eq!(reason(&fx), "every participant of a locked input must sign release");
    }

    #[test]
    fn test_release_settling_its_game_defers_signers() {
        let cast = Cast::new();
        let game = GameState {
            commit_ids: vec![],
            participants: vec![cast.player.party().clone(), cast.casino.party().clone()],
            id: Uuid::new_v4(),
            stakes: vec![3, 400],
            reveal_deadline: Utc::now(),
            paytable: PayoutTable::default(),
        };

        let mut fx = release_fixture(&cast);
        fx.commands[0].signers = vec![cast.player.public_key()];
        let g = fx.input(game.clone());
        fx.command(CommitCommand::Close { input: g }, &[&cast.player]);
        assert!(TokenContract.verify(&fx.build()).is_ok());

        // A game from another transaction does not free this pot.
        fx.inputs[g].state_ref = StateRef::new(SecureHash([4; 32]), 0);
        assert_eq!(reason(&fx), "every participant of a locked input must sign release");
    }

    #[test]
    fn test_lock_of_locked_input_needs_every_participant() {
        let cast = Cast::new();
        let bank = cast.bank.party();
        let mut fx = TxFixture::new();
        let a = fx.input(locked(&cast, 403));
        let b = fx.input(unlocked(cast.player.party(), bank, 1));
        let o = fx.output(TokenState::locked(vec![cast.player.party().clone()], bank.clone(), 404));
        fx.command(TokenCommand::Lock { inputs: vec![a, b], outputs: vec![o] }, &[&cast.player]);
        assert_eq!(reason(&fx), "every participant of a locked input must sign lock");

        fx.commands[0].signers.push(cast.casino.public_key());
        assert!(TokenContract.verify(&fx.build()).is_ok());
    }

    #[test]
    fn test_release_must_decrease_locked_sum() {
        let cast = Cast::new();
        let mut fx = TxFixture::new();
        let a = fx.input(locked(&cast, 10));
        let o = fx.output(locked(&cast, 10));
        fx.command(TokenCommand::Release { inputs: vec![a], outputs: vec![o] }, &[&cast.player]);
        assert_eq!(reason(&fx), "locked sums must decrease");
    }

    #[test]
    fn test_redeem_valid_with_change() {
        let cast = Cast::new();
        let bank = cast.bank.party();
        let mut fx = TxFixture::new();
        let a = fx.input(unlocked(cast.player.party(), bank, 10));
        let c = fx.output(unlocked(cast.player.party(), bank, 4));
        fx.command(
            TokenCommand::Redeem { inputs: vec![a], outputs: vec![c] },
            &[&cast.player, &cast.bank],
        );
        assert!(TokenContract.verify(&fx.build()).is_ok());
    }

    #[test]
    fn test_redeem_requires_issuer_and_decrease() {
        let cast = Cast::new();
        let bank = cast.bank.party();
        let mut fx = TxFixture::new();
        let a = fx.input(unlocked(cast.player.party(), bank, 10));
        let c = fx.output(unlocked(cast.player.party(), bank, 10));
        fx.command(
            TokenCommand::Redeem { inputs: vec![a], outputs: vec![c] },
            &[&cast.player, &cast.bank],
        );
        assert_eq!(reason(&fx), "redeem must reduce the total amount");

        fx.outputs.clear();
        fx.commands[0].value = Command::Token(TokenCommand::Redeem { inputs: vec![a], outputs: vec![] });
        fx.commands[0].signers = vec![cast.player.public_key()];
        assert_eq!(reason(&fx), "issuer must sign redemption");
    }

    #[test]
    fn test_redeem_tolerates_zero_inputs() {
        let cast = Cast::new();
        let mut fx = TxFixture::new();
        let a = fx.input(unlocked(cast.player.party(), cast.bank.party(), 0));
        fx.command(
            TokenCommand::Redeem { inputs: vec![a], outputs: vec![] },
            &[&cast.player, &cast.bank],
        );
        assert!(TokenContract.verify(&fx.build()).is_ok());
    }

    #[test]
    fn test_redeem_rejects_locked_inputs() {
        let cast = Cast::new();
        let mut fx = TxFixture::new();
        let a = fx.input(locked(&cast, 5));
        fx.command(
            TokenCommand::Redeem { inputs: vec![a], outputs: vec![] },
            &[&cast.player, &cast.bank],
        );
        assert_eq!(reason(&fx), "redeemed tokens must be unlocked");
    }

    #[test]
    fn test_overlapping_commands_rejected() {
        let cast = Cast::new();
        let mut fx = lock_fixture(&cast);
        fx.command(TokenCommand::Issue { outputs: vec![0] }, &[&cast.bank]);
        assert_eq!(reason(&fx), "output 0 claimed by more than one command");
    }

    #[test]
    fn test_uncovered_input_rejected() {
        let cast = Cast::new();
        let mut fx = lock_fixture(&cast);
        fx.input(unlocked(cast.player.party(), cast.bank.party(), 1));
        assert_eq!(reason(&fx), "input 2 is not covered by any command");
    }

    #[test]
    fn test_zero_amount_output_rejected() {
        let cast = Cast::new();
        let mut fx = lock_fixture(&cast);
        let z = fx.output(unlocked(cast.player.party(), cast.bank.party(), 0));
        if let Command::Token(TokenCommand::Lock { outputs, .. }) = &mut fx.commands[0].value {
            outputs.push(z);
        }
        assert_eq!(reason(&fx), "token outputs must have a positive amount");
    }

    proptest! {
        /// Any accepted lock or release conserves value and moves the
        /// locked sum in the declared direction.
        #[test]
        fn prop_lock_release_conservation(
            unlocked_in in 1u64..1_000,
            locked_in in 0u64..1_000,
            locked_out in 0u64..2_000,
            release in any::<bool>(),
        ) {
            let cast = Cast::new();
            let bank = cast.bank.party();
            let total_in = unlocked_in + locked_in;

            let mut fx = TxFixture::new();
            let mut inputs = vec![fx.input(unlocked(cast.player.party(), bank, unlocked_in))];
            if locked_in > 0 {
                inputs.push(fx.input(locked(&cast, locked_in)));
            }
            let mut outputs = Vec::new();
            if locked_out > 0 {
                outputs.push(fx.output(locked(&cast, locked_out)));
            }
            let free_out = total_in.saturating_sub(locked_out);
            if free_out > 0 {
                outputs.push(fx.output(unlocked(cast.player.party(), bank, free_out)));
            }
            let command = if release {
                TokenCommand::Release { inputs, outputs }
            } else {
                TokenCommand::Lock { inputs, outputs }
            };
            fx.command(command, &[&cast.player, &cast.casino]);

            let tx = fx.build();
            if TokenContract.verify(&tx).is_ok() {
                let ins: u64 = tx.inputs.iter().filter_map(|s| s.state.as_token()).map(|t| t.amount).sum();
                let outs: u64 = tx.outputs.iter().filter_map(|s| s.as_token()).map(|t| t.amount).sum();
                prop_assert_eq!(ins, outs);
                if release {
                    prop_assert!(locked_out < locked_in);
                } else {
                    prop_assert!(locked_out > locked_in);
                }
            }
        }
    }
}
