//! Ensemble - the session core for collaborative live coding.
//!
//! An operational-transformation engine keeps every peer's copy of the
//! shared buffers convergent, and a session server relays edits, cursor
//! positions, and evaluation requests between peers over TCP.
//!
//! # Quick Start
//!
//! ```
//! use ensemble::ot::{Client, Operation, Server};
//!
//! // One authority per shared buffer.
//! let mut server: Server<&str> = Server::new();
//! let mut editor = Client::new();
//!
//! // A local edit goes out tagged with the last seen revision.
//! let op = Operation::edit(0, 0, "Hello, World!");
//! let submission = editor.apply_local(op).unwrap().unwrap();
//!
//! // The authority transforms it past concurrent commits and applies it.
//! server.receive("editor", submission.revision, submission.operation).unwrap();
//! assert_eq!(server.document(), "Hello, World!");
//! ```

pub mod ot;
pub mod protocol;
pub mod session;
