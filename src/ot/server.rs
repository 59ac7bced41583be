//! The per-buffer authority that linearizes concurrent edits.
//!
//! Clients tag each operation with the revision they last saw. The server
//! transforms the operation forward through everything committed since
//! that revision, applies it to the canonical document, appends it to the
//! log, and hands the transformed operation back for broadcast. A rejected
//! operation never touches the canonical state.

use std::hash::Hash;

use super::{Operation, OtError, RevisionLog};

/// Canonical document plus revision history for one buffer.
#[derive(Clone, Debug, Default)]
pub struct Server<C> {
    document: String,
    log: RevisionLog<C>,
}

impl<C: Eq + Hash> Server<C> {
    /// Create an authority over an empty document at revision 0.
    pub fn new() -> Server<C> {
        return Server {
            document: String::new(),
            log: RevisionLog::new(),
        };
    }

    /// The canonical document text.
    pub fn document(&self) -> &str {
        return &self.document;
    }

    /// The current revision number.
    pub fn revision(&self) -> usize {
        return self.log.revision();
    }

    /// Receive an operation from `client`, authored against `revision`.
    ///
    /// Returns the transformed operation to broadcast, or `None` for a
    /// stale resubmission: if the client already has a commit in the log
    /// at or after the revision it claims to be editing from, this is a
    /// retransmission and is dropped without touching any state. Note the
    /// guard compares against `Some(0)` too: a client whose only commit
    /// produced revision 1 must not slip a duplicate through.
    pub fn receive(
        &mut self,
        client: C,
        revision: usize,
        op: Operation,
    ) -> Result<Option<Operation>, OtError> {
        if let Some(last) = self.log.last_committed_by(&client) {
            if last >= revision {
                return Ok(None);
            }
        }

        let mut op = op;
        for committed in self.log.since(revision) {
            op = op.transform(committed)?.0;
        }

        // Apply before append: a length mismatch must leave both the
        // document and the log untouched.
        self.document = op.apply(&self.document)?;
        self.log.append(client, op.clone());
        return Ok(Some(op));
    }

    /// Replace the canonical text, clearing the history.
    pub fn reset(&mut self, text: String) {
        self.document = text;
        self.log.clear();
    }

    /// Drop the revision history, keeping the document. Run whenever the
    /// set of connected peers changes; clients restart from revision 0
    /// against the snapshot they are sent.
    pub fn clear_history(&mut self) {
        self.log.clear();
    }
}
