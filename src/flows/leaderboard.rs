//! Leaderboard Flows
//!
//! Entries are built and notarised by the player alone; the proof of the
//! total is the set of referenced tokens.
//!
//! Overtaking consumes any live entry, ours or another player's, and puts
//! our own higher entry in its place. Only retiring is limited to our own
//! entries.

use chrono::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::contracts::LEADERBOARD_TIME_RADIUS_SECS;
use crate::flows::node::Node;
use crate::flows::FlowError;
use crate::ledger::party::{Party, PublicKey};
use crate::ledger::states::{LeaderboardEntry, StateAndRef, StateRef};
use crate::ledger::transaction::{LeaderboardCommand, SignedTransaction, TimeWindow, TransactionBuilder};

/// Places a fresh entry into the builder; called again after a conflict.
type Build<'a> = dyn Fn(&mut TransactionBuilder, LeaderboardEntry, PublicKey) + Send + Sync + 'a;

/// Publish an entry for our unlocked total from `issuer`.
#[instrument(skip_all, fields(player = %node.party()))]
pub(crate) async fn create(node: &Node, issuer: &Party) -> Result<SignedTransaction, FlowError> {
    submit_entry(node, issuer, &|builder, entry, signer| {
        let output = builder.add_output(entry);
        builder.add_command(LeaderboardCommand::Create { output }, vec![signer]);
    })
    .await
}

/// Replace the entry at `previous` with ours for our current total.
#[instrument(skip(node), fields(player = %node.party()))]
pub(crate) async fn overtake(node: &Node, previous: StateRef) -> Result<SignedTransaction, FlowError> {
    let old = live_entry(node, previous).await?;
    let (old_total, issuer, displaced) = match old.state.as_leaderboard() {
        Some(e) => (e.total, e.token_issuer.clone(), e.player.clone()),
        None => return Err(FlowError::InvalidRequest(format!("{} is not a leaderboard entry", previous))),
    };
    if displaced != *node.party() {
        info!(displaced = %displaced, total = old_total, "overtaking another player's entry");
    }

    let current = node.balance(&issuer).await;
    if current <= old_total {
        return Err(FlowError::InvalidRequest(format!(
            "total {} does not exceed the entry's {}",
            current, old_total
        )));
    }

    submit_entry(node, &issuer, &|builder, entry, signer| {
        let input = builder.add_input(old.clone());
        let output = builder.add_output(entry);
        builder.add_command(LeaderboardCommand::Overtake { input, output }, vec![signer]);
    })
    .await
}

/// Withdraw our entry at `entry`.
#[instrument(skip(node), fields(player = %node.party()))]
pub(crate) async fn retire(node: &Node, entry: StateRef) -> Result<SignedTransaction, FlowError> {
    let old = own_entry(node, entry).await?;

    let mut builder = TransactionBuilder::new();
    let input = builder.add_input(old);
    builder.add_command(LeaderboardCommand::Retire { input }, vec![node.keys().public_key()]);
    let stx = builder.sign(node.keys())?;
    let id = node.notarise(&stx).await?;
    info!(tx = %id.short(), "leaderboard entry retired");
    Ok(stx)
}

async fn live_entry(node: &Node, entry: StateRef) -> Result<StateAndRef, FlowError> {
    let state = node
        .ledger()
        .resolve_state(&entry)
        .await
        .ok_or_else(|| FlowError::InvalidRequest(format!("no live entry at {}", entry)))?;
    if state.as_leaderboard().is_none() {
        return Err(FlowError::InvalidRequest(format!("{} is not a leaderboard entry", entry)));
    }
    Ok(StateAndRef { state, state_ref: entry })
}

async fn own_entry(node: &Node, entry: StateRef) -> Result<StateAndRef, FlowError> {
    let live = live_entry(node, entry).await?;
    match live.state.as_leaderboard() {
        Some(e) if e.player == *node.party() => Ok(live),
        _ => Err(FlowError::InvalidRequest("entry belongs to another player".into())),
    }
}

/// Reference our tokens, stamp the entry, let `build` place it, sign and
/// notarise. Tokens spent concurrently surface as conflicts and are
/// re-read.
async fn submit_entry(node: &Node, issuer: &Party, build: &Build<'_>) -> Result<SignedTransaction, FlowError> {
    let radius = Duration::seconds(LEADERBOARD_TIME_RADIUS_SECS / 2);
    let mut attempt = 0;
    loop {
        let tokens = node.ledger().spendable_tokens(node.party(), issuer).await;
        let now = node.clock().now();
        let entry = LeaderboardEntry {
            player: node.party().clone(),
            total: tokens.iter().filter_map(|s| s.state.as_token()).map(|t| t.amount).sum(),
            token_issuer: issuer.clone(),
            creation: now,
            id: Uuid::new_v4(),
        };
        let total = entry.total;

        let mut builder = TransactionBuilder::new();
        for token in tokens {
            builder.add_reference(token);
        }
        build(&mut builder, entry, node.keys().public_key());
        builder.set_time_window(TimeWindow::between(now - radius, now + radius));

        let stx = builder.sign(node.keys())?;
        match node.notarise(&stx).await {
            Ok(id) => {
                info!(tx = %id.short(), total, "leaderboard entry published");
                return Ok(stx);
            }
            Err(e) if e.is_conflict() && attempt < node.config().max_notary_retries => {
                warn!(attempt, "referenced tokens moved, rebuilding entry");
                attempt += 1;
            }
            Err(e) if e.is_conflict() => return Err(FlowError::RetriesExhausted(attempt + 1)),
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::testing::TestNet;

    #[tokio::test]
    async fn test_create_overtake_retire() {
        let net = TestNet::new().await;
        let bank = net.bank.party().clone();
        net.bank.issue_tokens(&[(net.player.party().clone(), 5), (net.player.party().clone(), 4)]).await.unwrap();

        let created = net.player.create_leaderboard_entry(&bank).await.unwrap();
        let board = net.player.leaderboard().await;
        assert_eq!(board.len(), 1);
        assert_eq!(board[0].1.total, 9);
        assert_eq!(board[0].0, created.out_ref(0).unwrap());

        assert!(matches!(
            net.player.overtake(board[0].0).await,
            Err(FlowError::InvalidRequest(_))
        ));

        net.bank.issue_tokens(&[(net.player.party().clone(), 1)]).await.unwrap();
        let overtaken = net.player.overtake(board[0].0).await.unwrap();
        let board = net.player.leaderboard().await;
        assert_eq!(board.len(), 1);
        assert_eq!(board[0].1.total, 10);

        net.player.retire(overtaken.out_ref(0).unwrap()).await.unwrap();
        assert!(net.player.leaderboard().await.is_empty());
    }

    #[tokio::test]
    async fn test_board_sorted_by_total() {
        let net = TestNet::new().await;
        let bank = net.bank.party().clone();
        net.bank
            .issue_tokens(&[(net.player.party().clone(), 3), (net.casino.party().clone(), 400)])
            .await
            .unwrap();

        net.player.create_leaderboard_entry(&bank).await.unwrap();
        net.casino.create_leaderboard_entry(&bank).await.unwrap();

        let totals: Vec<u64> = net.bank.leaderboard().await.iter().map(|(_, e)| e.total).collect();
        assert_eq!(totals, vec![400, 3]);
    }

    #[tokio::test]
    async fn test_overtake_another_players_entry() {
        let net = TestNet::new().await;
        let bank = net.bank.party().clone();
        net.bank
            .issue_tokens(&[(net.player.party().clone(), 5), (net.casino.party().clone(), 3)])
            .await
            .unwrap();
        let theirs = net.casino.create_leaderboard_entry(&bank).await.unwrap();

        net.player.overtake(theirs.out_ref(0).unwrap()).await.unwrap();
        let board = net.player.leaderboard().await;
        assert_eq!(board.len(), 1);
        assert_eq!(&board[0].1.player, net.player.party());
        assert_eq!(board[0].1.total, 5);

        // A lower total cannot displace it.
        assert!(matches!(
            net.casino.overtake(board[0].0).await,
            Err(FlowError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_cannot_retire_foreign_entry() {
        let net = TestNet::new().await;
        let bank = net.bank.party().clone();
        let stx = net.casino.create_leaderboard_entry(&bank).await.unwrap();
        assert!(matches!(
            net.player.retire(stx.out_ref(0).unwrap()).await,
            Err(FlowError::InvalidRequest(_))
        ));
    }
}
