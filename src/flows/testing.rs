//! In-process network of a bank, a casino and a player for flow tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::clock::ManualClock;
use crate::core::hash::SecureHash;
use crate::core::rng::SeededSecretSource;
use crate::flows::config::FlowConfig;
use crate::flows::node::{Node, NodeServices};
use crate::ledger::party::KeyPair;
use crate::ledger::states::StateRef;
use crate::ledger::store::{InMemoryLedger, Notary, NotaryError};
use crate::ledger::transaction::{Command, SignedTransaction, TokenCommand};
use crate::network::directory::{InMemoryDirectory, InMemoryNetwork, InboundSession, NetworkAddress};

/// Notary that reports a conflict for the first few lock transactions.
pub(crate) struct FlakyNotary {
    inner: Arc<InMemoryLedger>,
    remaining: AtomicU32,
    raised: AtomicU32,
}

impl FlakyNotary {
    fn new(inner: Arc<InMemoryLedger>, conflicts: u32) -> Self {
        Self {
            inner,
            remaining: AtomicU32::new(conflicts),
            raised: AtomicU32::new(0),
        }
    }

    pub fn conflicts_raised(&self) -> u32 {
        self.raised.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Notary for FlakyNotary {
    async fn submit(&self, stx: &SignedTransaction) -> Result<SecureHash, NotaryError> {
        let locks = stx
            .tx
            .commands
            .iter()
            .any(|c| matches!(c.value, Command::Token(TokenCommand::Lock { .. })));
        if locks
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            self.raised.fetch_add(1, Ordering::SeqCst);
            let state = stx
                .tx
                .inputs
                .first()
                .copied()
                .unwrap_or_else(|| StateRef::new(SecureHash([0; 32]), 0));
            return Err(NotaryError::Conflict { state });
        }
        self.inner.submit(stx).await
    }
}

#[derive(Default)]
pub(crate) struct NetOptions {
    pub config: FlowConfig,
    /// Lock transactions to fail with a conflict before passing through.
    pub commit_conflicts: u32,
    /// Leave the casino's inbox to the test instead of serving it.
    pub silent_casino: bool,
}

pub(crate) struct TestNet {
    pub ledger: Arc<InMemoryLedger>,
    pub notary: Arc<FlakyNotary>,
    pub clock: Arc<ManualClock>,
    pub bank: Arc<Node>,
    pub casino: Arc<Node>,
    pub player: Arc<Node>,
    pub casino_inbox: Option<mpsc::Receiver<InboundSession>>,
}

impl TestNet {
    pub async fn new() -> Self {
        Self::with(NetOptions::default()).await
    }

    pub async fn with(options: NetOptions) -> Self {
        let clock = Arc::new(ManualClock::new());
        let ledger = Arc::new(InMemoryLedger::new(clock.clone()));
        let notary = Arc::new(FlakyNotary::new(ledger.clone(), options.commit_conflicts));
        let directory = Arc::new(InMemoryDirectory::new());
        let network = Arc::new(InMemoryNetwork::new());
        let services = NodeServices {
            ledger: ledger.clone(),
            notary: notary.clone(),
            directory: directory.clone(),
            network: network.clone(),
            clock: clock.clone(),
        };

        let mut nodes = Vec::new();
        for (seed, name) in [(1u64, "bank"), (2, "casino"), (3, "player")] {
            let keys = KeyPair::generate(name, &SeededSecretSource::new(seed));
            let address = NetworkAddress::memory(name);
            let inbox = network.bind(address.clone()).await;
            let secrets = Arc::new(SeededSecretSource::new(seed * 1000));
            let node = Arc::new(Node::new(keys, address, services.clone(), secrets, options.config.clone()));
            directory.register(name, node.peer()).await;
            nodes.push((node, inbox));
        }

        let (player, player_inbox) = nodes.pop().expect("player");
        let (casino, casino_inbox) = nodes.pop().expect("casino");
        let (bank, bank_inbox) = nodes.pop().expect("bank");
        bank.spawn_responders(bank_inbox);
        player.spawn_responders(player_inbox);
        let casino_inbox = if options.silent_casino {
            Some(casino_inbox)
        } else {
            casino.spawn_responders(casino_inbox);
            None
        };

        Self { ledger, notary, clock, bank, casino, player, casino_inbox }
    }
}
