//! Fair Slots Demo
//!
//! Runs a bank, a casino and a player in one process over an in-memory
//! ledger and network: issues tokens, plays a few games concurrently,
//! publishes leaderboard entries and redeems the winnings.

use std::sync::Arc;

use anyhow::Context;
use futures_util::future::join_all;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fair_slots::{
    core::{clock::SystemClock, rng::OsSecretSource},
    ledger::KeyPair,
    network::{InMemoryDirectory, InMemoryNetwork, NetworkAddress},
    FlowConfig, InMemoryLedger, Node, NodeServices, VERSION,
};

const GAMES: usize = 3;
const WAGER: u64 = 3;
const CASINO_BANKROLL: u64 = 400;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("failed to set tracing subscriber")?;

    let config = FlowConfig::from_env();
    info!("Fair Slots v{}", VERSION);
    info!(
        "Reveal window: {}s, notary retries: {}, expected payout per unit: {:.4}",
        config.reveal_window.num_seconds(),
        config.max_notary_retries,
        config.paytable.expected_payout()
    );

    let clock = Arc::new(SystemClock);
    let ledger = Arc::new(InMemoryLedger::new(clock.clone()));
    let directory = Arc::new(InMemoryDirectory::new());
    let network = Arc::new(InMemoryNetwork::new());
    let services = NodeServices {
        ledger: ledger.clone(),
        notary: ledger.clone(),
        directory: directory.clone(),
        network: network.clone(),
        clock,
    };

    let mut nodes = Vec::new();
    for name in ["bank", "casino", "player"] {
        let keys = KeyPair::generate(name, &OsSecretSource);
        let address = NetworkAddress::memory(name);
        let inbox = network.bind(address.clone()).await;
        let node = Arc::new(Node::new(keys, address, services.clone(), Arc::new(OsSecretSource), config.clone()));
        directory.register(name, node.peer()).await;
        node.spawn_responders(inbox);
        nodes.push(node);
    }
    let (bank, casino, player) = (&nodes[0], &nodes[1], &nodes[2]);
    let issuer = bank.party().clone();

    // Fund one bankroll token per concurrent game.
    let mut grants: Vec<_> = (0..GAMES).map(|_| (casino.party().clone(), CASINO_BANKROLL)).collect();
    grants.extend((0..GAMES).map(|_| (player.party().clone(), WAGER)));
    bank.issue_tokens(&grants).await.context("issuing tokens")?;
    info!(
        "Funded: casino {} / player {}",
        casino.balance(&issuer).await,
        player.balance(&issuer).await
    );

    info!("=== Playing {} games ===", GAMES);
    let outcomes = join_all((0..GAMES).map(|_| player.play_game("casino", WAGER, &issuer))).await;
    for (i, outcome) in outcomes.iter().enumerate() {
        match &outcome.error {
            None => info!("Game {}: payout {} (balance {})", i + 1, outcome.payout, outcome.balance),
            Some(reason) => warn!("Game {}: failed: {}", i + 1, reason),
        }
    }

    info!("=== Leaderboard ===");
    for node in [player, casino] {
        if let Err(e) = node.create_leaderboard_entry(&issuer).await {
            warn!("{} could not publish an entry: {}", node.party().name, e);
        }
    }
    for (rank, (_, entry)) in bank.leaderboard().await.iter().enumerate() {
        info!("#{}: {} - {}", rank + 1, entry.player.name, entry.total);
    }

    let winnings = player.balance(&issuer).await;
    if winnings > 0 {
        player.redeem_tokens(winnings, "bank").await.context("redeeming winnings")?;
        info!("Player redeemed {}", winnings);
    }

    info!(
        "Final: casino {} / player {}",
        casino.balance(&issuer).await,
        player.balance(&issuer).await
    );
    Ok(())
}
