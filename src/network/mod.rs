//! Networking Module
//!
//! The message-driven outer layer: wire schema, collaborator seams for
//! the chain oracle and peer transport, and the session state machine.

pub mod chain;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-export key types
pub use chain::{ChainOracle, MockOracle, OracleError, RoomPlayer, RoomRoster};
pub use protocol::{Envelope, NetMessage, SyncPayload, PROTOCOL_VERSION};
pub use session::{
    Session, SessionConfig, SessionError, SessionEvent, SessionHandle, SessionStatus,
};
pub use transport::{memory_pair, MemoryPeer, PeerTransport, TransportError, TransportEvent};
