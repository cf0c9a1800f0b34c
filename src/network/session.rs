//! Flow Sessions
//!
//! An ordered, reliable channel between two named parties. Frames are JSON
//! strings; [`FlowSession`] adds typed send/receive on top of any
//! [`SessionTransport`].

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::trace;
use uuid::Uuid;

use crate::ledger::party::Party;
use crate::network::protocol::FlowMessage;

/// Frames buffered per direction.
pub const SESSION_BUFFER: usize = 32;

/// Session failures.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The other end went away.
    #[error("session closed by counterparty")]
    Closed,

    /// A frame could not be encoded or decoded.
    #[error("malformed frame: {0}")]
    Codec(#[from] serde_json::Error),

    /// The counterparty sent something the flow did not expect.
    #[error("unexpected message: expected {expected}, got {got}")]
    Unexpected {
        /// What the flow waited for.
        expected: &'static str,
        /// What arrived.
        got: &'static str,
    },

    /// No session could be opened to the address.
    #[error("no route to {0}")]
    Unreachable(String),
}

/// Ordered, reliable frame delivery.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Queue a frame for the counterparty.
    async fn send_frame(&self, frame: String) -> Result<(), SessionError>;

    /// Next frame from the counterparty.
    async fn receive_frame(&self) -> Result<String, SessionError>;
}

/// One end of an in-process channel pair.
pub struct ChannelTransport {
    tx: mpsc::Sender<String>,
    rx: Mutex<mpsc::Receiver<String>>,
}

impl ChannelTransport {
    /// Two connected ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(SESSION_BUFFER);
        let (b_tx, b_rx) = mpsc::channel(SESSION_BUFFER);
        (
            Self { tx: a_tx, rx: Mutex::new(b_rx) },
            Self { tx: b_tx, rx: Mutex::new(a_rx) },
        )
    }
}

#[async_trait]
impl SessionTransport for ChannelTransport {
    async fn send_frame(&self, frame: String) -> Result<(), SessionError> {
        self.tx.send(frame).await.map_err(|_| SessionError::Closed)
    }

    async fn receive_frame(&self) -> Result<String, SessionError> {
        self.rx.lock().await.recv().await.ok_or(SessionError::Closed)
    }
}

/// A typed session with one counterparty.
pub struct FlowSession {
    id: Uuid,
    counterparty: Party,
    transport: Box<dyn SessionTransport>,
}

impl FlowSession {
    /// Wrap a transport.
    pub fn new(id: Uuid, counterparty: Party, transport: Box<dyn SessionTransport>) -> Self {
        Self { id, counterparty, transport }
    }

    /// Session id, shared by both ends.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The party on the other end.
    pub fn counterparty(&self) -> &Party {
        &self.counterparty
    }

    /// Send any serializable value.
    pub async fn send<T: Serialize + Sync>(&self, value: &T) -> Result<(), SessionError> {
        let frame = serde_json::to_string(value)?;
        trace!(session = %self.id, to = %self.counterparty, bytes = frame.len(), "send");
        self.transport.send_frame(frame).await
    }

    /// Receive the next value as `T`.
    pub async fn receive<T: DeserializeOwned>(&self) -> Result<T, SessionError> {
        let frame = self.transport.receive_frame().await?;
        trace!(session = %self.id, from = %self.counterparty, bytes = frame.len(), "receive");
        Ok(serde_json::from_str(&frame)?)
    }

    /// Send a protocol message.
    pub async fn send_message(&self, message: &FlowMessage) -> Result<(), SessionError> {
        self.send(message).await
    }

    /// Receive the next protocol message.
    pub async fn receive_message(&self) -> Result<FlowMessage, SessionError> {
        self.receive().await
    }
}

impl std::fmt::Debug for FlowSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowSession")
            .field("id", &self.id)
            .field("counterparty", &self.counterparty)
            .finish()
    }
}

/// Connected pair of sessions, for tests and in-process wiring.
pub fn session_pair(a: Party, b: Party) -> (FlowSession, FlowSession) {
    let id = Uuid::new_v4();
    let (ta, tb) = ChannelTransport::pair();
    (
        FlowSession::new(id, b, Box::new(ta)),
        FlowSession::new(id, a, Box::new(tb)),
    )
}
