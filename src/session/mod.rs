//! The session layer: peers, shared buffers, the relay core, and the
//! TCP runtime around them.
//!
//! The split mirrors the protocol: [`hub::Hub`] is the synchronous state
//! machine deciding what every packet means, [`server::Server`] is the
//! tokio plumbing that moves bytes to and from it. Nothing above the hub
//! touches a socket; nothing below it touches session state.

mod buffer;
mod hub;
mod peer;
mod server;

pub use buffer::SharedBuffer;
pub use hub::{HandshakeOutcome, Hub, Outbox};
pub use peer::{PeerState, PeerTable};
pub use server::{routable_ip, Server, ServerConfig};

use crate::protocol::FrameError;

/// Failures on one connection's path through the session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connection closed before the handshake completed")]
    HandshakeEof,

    #[error("handshake rejected with code {0}")]
    Rejected(i32),

    #[error("session relay has shut down")]
    RelayGone,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("malformed packet: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
