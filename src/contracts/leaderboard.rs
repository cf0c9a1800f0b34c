//! Leaderboard Contract
//!
//! An entry is a provable claim: the transaction that creates it must
//! reference the player's unlocked tokens and their sum must equal the
//! claimed total.

use chrono::Duration;

use crate::contracts::{require, signed_by, Contract, ContractError, IndexClaims};
use crate::ledger::party::PublicKey;
use crate::ledger::states::{ContractState, LeaderboardEntry};
use crate::ledger::transaction::{Command, LeaderboardCommand, LedgerTransaction};

/// How far either time-window bound may sit from an entry's creation time.
pub const LEADERBOARD_TIME_RADIUS_SECS: i64 = 60;

/// Leaderboard family contract.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeaderboardContract;

impl Contract for LeaderboardContract {
    fn verify(&self, tx: &LedgerTransaction) -> Result<(), ContractError> {
        verify_entries(tx).map_err(ContractError::Leaderboard)
    }
}

fn verify_entries(tx: &LedgerTransaction) -> Result<(), String> {
    let mut claims = IndexClaims::default();

    for command in &tx.commands {
        let Command::Leaderboard(lb_command) = &command.value else {
            continue;
        };
        let signers = command.signers.as_slice();

        match *lb_command {
            LeaderboardCommand::Create { output } => {
                claims.claim_output(tx, output)?;
                let entry = output_entry(tx, output)?;
                verify_claim(tx, entry, signers)?;
            }
            LeaderboardCommand::Overtake { input, output } => {
                claims.claim_input(tx, input)?;
                claims.claim_output(tx, output)?;
                let old = input_entry(tx, input)?;
                let new = output_entry(tx, output)?;
                verify_claim(tx, new, signers)?;
                require(
                    new.token_issuer == old.token_issuer,
                    "overtake must keep the token issuer",
                )?;
                require(new.total > old.total, "new total must exceed the overtaken entry")?;
            }
            LeaderboardCommand::Retire { input } => {
                claims.claim_input(tx, input)?;
                let entry = input_entry(tx, input)?;
                require(signed_by(signers, &entry.player), "player must sign retirement")?;
            }
        }
    }

    claims.check_coverage(tx, |s| matches!(s, ContractState::Leaderboard(_)))
}

fn output_entry(tx: &LedgerTransaction, index: usize) -> Result<&LeaderboardEntry, String> {
    tx.outputs[index]
        .as_leaderboard()
        .ok_or_else(|| format!("output {} is not a leaderboard entry", index))
}

fn input_entry(tx: &LedgerTransaction, index: usize) -> Result<&LeaderboardEntry, String> {
    tx.inputs[index]
        .state
        .as_leaderboard()
        .ok_or_else(|| format!("input {} is not a leaderboard entry", index))
}

/// Referenced tokens back the total, the window brackets the creation
/// time, and the player signs.
fn verify_claim(tx: &LedgerTransaction, entry: &LeaderboardEntry, signers: &[PublicKey]) -> Result<(), String> {
    let referenced: u128 = tx
        .references
        .iter()
        .filter_map(|r| r.state.as_token())
        .filter(|t| t.is_spendable_by(&entry.player, &entry.token_issuer))
        .map(|t| u128::from(t.amount))
        .sum();
    require(
        referenced == u128::from(entry.total),
        "entry total must equal the referenced unlocked tokens",
    )?;

    let window = tx.time_window.ok_or("entry needs a time window")?;
    let (from, until) = match (window.from, window.until) {
        (Some(from), Some(until)) => (from, until),
        _ => return Err("entry time window needs both bounds".into()),
    };
    let radius = Duration::seconds(LEADERBOARD_TIME_RADIUS_SECS);
    let near = |t: chrono::DateTime<chrono::Utc>| (t - entry.creation).abs() <= radius;
    require(
        near(from) && near(until),
        "entry time window must lie within the creation radius",
    )?;

    require(signed_by(signers, &entry.player), "player must sign the entry")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::testing::{Cast, TxFixture};
    use crate::ledger::states::TokenState;
    use crate::ledger::transaction::TimeWindow;
    use chrono::{DateTime, Utc};
    use proptest::prelude::*;
    use uuid::Uuid;

    fn entry(cast: &Cast, total: u64, creation: DateTime<Utc>) -> LeaderboardEntry {
        LeaderboardEntry {
            player: cast.player.party().clone(),
            total,
            token_issuer: cast.bank.party().clone(),
            creation,
            id: Uuid::new_v4(),
        }
    }

    fn around(t: DateTime<Utc>) -> TimeWindow {
        TimeWindow::between(t - Duration::seconds(30), t + Duration::seconds(30))
    }

    fn create_fixture(cast: &Cast, amounts: &[u64], total: u64) -> TxFixture {
        let now = Utc::now();
        let mut fx = TxFixture::new();
        for amount in amounts {
            fx.reference(TokenState::unlocked(cast.player.party().clone(), cast.bank.party().clone(), *amount));
        }
        let o = fx.output(entry(cast, total, now));
        fx.command(LeaderboardCommand::Create { output: o }, &[&cast.player]);
        fx.window(around(now));
        fx
    }

    fn overtake_fixture(cast: &Cast, old_total: u64, new_total: u64) -> TxFixture {
        let now = Utc::now();
        let mut fx = TxFixture::new();
        fx.reference(TokenState::unlocked(cast.player.party().clone(), cast.bank.party().clone(), new_total));
        let i = fx.input(entry(cast, old_total, now - Duration::hours(1)));
        let o = fx.output(entry(cast, new_total, now));
        fx.command(LeaderboardCommand::Overtake { input: i, output: o }, &[&cast.player]);
        fx.window(around(now));
        fx
    }

    fn reason(fx: &TxFixture) -> String {
        LeaderboardContract.verify(&fx.build()).unwrap_err().reason().to_string()
    }

    #[test]
    fn test_create_valid() {
        let cast = Cast::new();
        let fx = create_fixture(&cast, &[10, 5], 15);
        assert!(LeaderboardContract.verify(&fx.build()).is_ok());
    }

    #[test]
    fn test_create_ignores_foreign_tokens() {
        let cast = Cast::new();
        let mut fx = create_fixture(&cast, &[10], 10);
        fx.reference(TokenState::unlocked(cast.casino.party().clone(), cast.bank.party().clone(), 99));
        fx.reference(TokenState::unlocked(cast.player.party().clone(), cast.casino.party().clone(), 99));
        fx.reference(TokenState::locked(vec![cast.player.party().clone()], cast.bank.party().clone(), 99));
        assert!(LeaderboardContract.verify(&fx.build()).is_ok());
    }

    #[test]
    fn test_create_total_mismatch() {
        let cast = Cast::new();
        let fx = create_fixture(&cast, &[10, 5], 16);
        assert_eq!(reason(&fx), "entry total must equal the referenced unlocked tokens");
    }

    #[test]
    fn test_create_needs_both_bounds() {
        let cast = Cast::new();
        let mut fx = create_fixture(&cast, &[10], 10);
        fx.window(TimeWindow::until_only(Utc::now()));
        assert_eq!(reason(&fx), "entry time window needs both bounds");

        fx.time_window = None;
        assert_eq!(reason(&fx), "entry needs a time window");
    }

    #[test]
    fn test_create_stale_window_rejected() {
        let cast = Cast::new();
        let mut fx = create_fixture(&cast, &[10], 10);
        let now = Utc::now();
        fx.window(TimeWindow::between(now - Duration::seconds(120), now));
        assert_eq!(reason(&fx), "entry time window must lie within the creation radius");
    }

    #[test]
    fn test_create_requires_player_signature() {
        let cast = Cast::new();
        let mut fx = create_fixture(&cast, &[10], 10);
        fx.commands[0].signers = vec![cast.casino.public_key()];
        assert_eq!(reason(&fx), "player must sign the entry");
    }

    #[test]
    fn test_overtake_valid() {
        let cast = Cast::new();
        let fx = overtake_fixture(&cast, 10, 11);
        assert!(LeaderboardContract.verify(&fx.build()).is_ok());
    }

    #[test]
    fn test_overtake_of_another_players_entry() {
        let cast = Cast::new();
        let mut fx = overtake_fixture(&cast, 10, 11);
        if let ContractState::Leaderboard(old) = &mut fx.inputs[0].state {
            old.player = cast.casino.party().clone();
        }
        assert!(LeaderboardContract.verify(&fx.build()).is_ok());

        // The displaced player cannot sign for the new entry.
        fx.commands[0].signers = vec![cast.casino.public_key()];
        assert_eq!(reason(&fx), "player must sign the entry");
    }

    #[test]
    fn test_overtake_must_keep_issuer() {
        let cast = Cast::new();
        let mut fx = overtake_fixture(&cast, 10, 11);
        if let ContractState::Leaderboard(old) = &mut fx.inputs[0].state {
            old.token_issuer = cast.casino.party().clone();
        }
        assert_eq!(reason(&fx), "overtake must keep the token issuer");
    }

    #[test]
    fn test_retire_requires_player() {
        let cast = Cast::new();
        let mut fx = TxFixture::new();
        let i = fx.input(entry(&cast, 10, Utc::now()));
        fx.command(LeaderboardCommand::Retire { input: i }, &[&cast.player]);
        assert!(LeaderboardContract.verify(&fx.build()).is_ok());

        fx.commands[0].signers = vec![cast.bank.public_key()];
        assert_eq!(reason(&fx), "player must sign retirement");
    }

    #[test]
    fn test_consumed_entry_must_be_covered() {
        let cast = Cast::new();
        let mut fx = TxFixture::new();
        fx.input(entry(&cast, 10, Utc::now()));
        assert_eq!(reason(&fx), "input 0 is not covered by any command");
    }

    proptest! {
        #[test]
        fn prop_overtake_needs_strictly_higher_total(old in 0u64..1_000, new in 1u64..1_000) {
            let cast = Cast::new();
            let fx = overtake_fixture(&cast, old, new);
            let result = LeaderboardContract.verify(&fx.build());
            prop_assert_eq!(result.is_ok(), new > old);
        }

        #[test]
        fn prop_accepted_total_matches_references(amounts in prop::collection::vec(1u64..500, 1..6), skew in 0u64..3) {
            let cast = Cast::new();
            let sum: u64 = amounts.iter().sum();
            let fx = create_fixture(&cast, &amounts, sum + skew);
            prop_assert_eq!(LeaderboardContract.verify(&fx.build()).is_ok(), skew == 0);
        }
    }
}
