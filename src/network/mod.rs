//! Network Layer
//!
//! Sessions between parties and the directory that finds them.
//! This layer is **non-deterministic**; all validation runs through `contracts/`.

pub mod directory;
pub mod protocol;
pub mod session;

pub use directory::{
    IdentityResolver, InMemoryDirectory, InMemoryNetwork, InboundSession, Network, NetworkAddress, Peer,
};
pub use protocol::{FlowKind, FlowMessage};
pub use session::{session_pair, ChannelTransport, FlowSession, SessionError, SessionTransport};
