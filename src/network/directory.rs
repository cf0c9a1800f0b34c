//! Identity Directory and Session Hub
//!
//! Flows name counterparties by handle. The directory maps a handle to a
//! party and a network address; the network opens sessions to addresses
//! and hands the far end to whoever is bound there.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::ledger::party::Party;
use crate::network::protocol::FlowKind;
use crate::network::session::{session_pair, FlowSession, SessionError};

/// Inbound sessions queued per bound address.
const INBOX_CAPACITY: usize = 64;

/// Where a party can be reached.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NetworkAddress(pub String);

impl NetworkAddress {
    /// In-process address for `name`.
    pub fn memory(name: &str) -> Self {
        Self(format!("mem://{}", name))
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A resolved counterparty.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Identity and signing key.
    pub party: Party,
    /// Reachable address.
    pub address: NetworkAddress,
}

/// Maps opaque handles to peers.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Peer registered under `handle`.
    async fn resolve(&self, handle: &str) -> Option<Peer>;
}

/// Handle table held in memory.
#[derive(Default)]
pub struct InMemoryDirectory {
    peers: RwLock<BTreeMap<String, Peer>>,
}

impl InMemoryDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace `handle`.
    pub async fn register(&self, handle: impl Into<String>, peer: Peer) {
        self.peers.write().await.insert(handle.into(), peer);
    }
}

#[async_trait]
impl IdentityResolver for InMemoryDirectory {
    async fn resolve(&self, handle: &str) -> Option<Peer> {
        self.peers.read().await.get(handle).cloned()
    }
}

/// A session opened by a counterparty.
#[derive(Debug)]
pub struct InboundSession {
    /// Responder flow to run.
    pub kind: FlowKind,
    /// Responder's end.
    pub session: FlowSession,
}

/// Opens sessions to peers.
#[async_trait]
pub trait Network: Send + Sync {
    /// Open a session from `from` to `to` for a flow of `kind`.
    async fn open(&self, from: &Party, to: &Peer, kind: FlowKind) -> Result<FlowSession, SessionError>;
}

/// In-process session hub.
#[derive(Default)]
pub struct InMemoryNetwork {
    inboxes: RwLock<BTreeMap<NetworkAddress, mpsc::Sender<InboundSession>>>,
}

impl InMemoryNetwork {
    /// Empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen at `address`. Rebinding replaces the previous listener.
    pub async fn bind(&self, address: NetworkAddress) -> mpsc::Receiver<InboundSession> {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.inboxes.write().await.insert(address, tx);
        rx
    }
}

#[async_trait]
impl Network for InMemoryNetwork {
    async fn open(&self, from: &Party, to: &Peer, kind: FlowKind) -> Result<FlowSession, SessionError> {
        let inbox = self
            .inboxes
            .read()
            .await
            .get(&to.address)
            .cloned()
            .ok_or_else(|| SessionError::Unreachable(to.address.to_string()))?;

        let (local, remote) = session_pair(from.clone(), to.party.clone());
        debug!(session = %local.id(), from = %from, to = %to.address, ?kind, "opening session");

        inbox
            .send(InboundSession { kind, session: remote })
            .await
            .map_err(|_| SessionError::Unreachable(to.address.to_string()))?;
        Ok(local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rng::SeededSecretSource;
    use crate::ledger::party::KeyPair;
    use crate::network::protocol::FlowMessage;

    fn peer(name: &str, seed: u64) -> Peer {
        let keys = KeyPair::generate(name, &SeededSecretSource::new(seed));
        Peer { party: keys.party().clone(), address: NetworkAddress::memory(name) }
    }

    #[tokio::test]
    async fn test_directory_resolves_handles() {
        let directory = InMemoryDirectory::new();
        let casino = peer("casino", 1);
        directory.register("casino", casino.clone()).await;

        assert_eq!(directory.resolve("casino").await, Some(casino));
        assert_eq!(directory.resolve("nobody").await, None);
    }

    #[tokio::test]
    async fn test_open_delivers_far_end() {
        let network = InMemoryNetwork::new();
        let player = peer("player", 1);
        let casino = peer("casino", 2);
        let mut inbox = network.bind(casino.address.clone()).await;

        let local = network.open(&player.party, &casino, FlowKind::Play).await.unwrap();
        let inbound = inbox.recv().await.unwrap();
        assert_eq!(inbound.kind, FlowKind::Play);
        assert_eq!(inbound.session.id(), local.id());
        assert_eq!(inbound.session.counterparty(), &player.party);

        local.send_message(&FlowMessage::Retry { attempt: 0 }).await.unwrap();
        assert_eq!(inbound.session.receive_message().await.unwrap().kind(), "retry");
    }

    #[tokio::test]
    async fn test_unbound_address_unreachable() {
        let network = InMemoryNetwork::new();
        let player = peer("player", 1);
        let casino = peer("casino", 2);
        let err = network.open(&player.party, &casino, FlowKind::Redeem).await.unwrap_err();
        assert!(matches!(err, SessionError::Unreachable(addr) if addr == "mem://casino"));
    }
}
