//! The operational-transformation engine.
//!
//! Everything here is pure state: no sockets, no tasks. The [`Operation`]
//! algebra (compose/invert/transform) lives at the bottom, the per-buffer
//! [`Server`] authority and the per-connection [`Client`] acknowledgement
//! machine are two independent users of it. There is exactly one transform
//! algorithm, so both roles share the same tagged-variant operation type
//! rather than a class hierarchy.

mod client;
mod log;
mod operation;
mod server;
mod undo;

pub use client::{Client, State, Submission};
pub use log::RevisionLog;
pub use operation::{Atom, Operation};
pub use server::Server;
pub use undo::{UndoStack, DEFAULT_UNDO_LIMIT};

/// Errors surfaced by the OT engine.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum OtError {
    /// An operation's consumed length does not fit the document it was
    /// applied or transformed against.
    #[error("operation spans {expected} chars but the document holds {found}")]
    IncompatibleOperation { expected: usize, found: usize },

    /// The server acknowledged an operation when none was in flight.
    /// Tolerated around barrier resets; callers log and ignore it.
    #[error("acknowledgement received with no operation in flight")]
    UnexpectedAck,
}
