//! Per-buffer revision history.
//!
//! The log is the server's append-only record of committed operations,
//! indexed by revision. A log holding `n` operations is at revision `n`;
//! the operation stored at index `i` produced revision `i + 1`. Alongside
//! the history the log records, per client, the index of that client's
//! most recent commit: the duplicate guard the authority uses to drop
//! stale resubmissions.

use std::hash::Hash;

use rustc_hash::FxHashMap;

use super::Operation;

/// Append-only operation history for one buffer, generic over the client
/// identifier so the algebra stays independent of the session layer.
#[derive(Clone, Debug, Default)]
pub struct RevisionLog<C> {
    ops: Vec<Operation>,
    last_by_client: FxHashMap<C, usize>,
}

impl<C: Eq + Hash> RevisionLog<C> {
    /// Create an empty log at revision 0.
    pub fn new() -> RevisionLog<C> {
        return RevisionLog {
            ops: Vec::new(),
            last_by_client: FxHashMap::default(),
        };
    }

    /// The current revision: the number of committed operations.
    pub fn revision(&self) -> usize {
        return self.ops.len();
    }

    /// Append a committed operation on behalf of `client`.
    pub fn append(&mut self, client: C, op: Operation) {
        self.last_by_client.insert(client, self.ops.len());
        self.ops.push(op);
    }

    /// The operation that produced revision `revision + 1`, if committed.
    pub fn get(&self, revision: usize) -> Option<&Operation> {
        return self.ops.get(revision);
    }

    /// All operations committed at or after `revision`, clamped to the
    /// history that exists.
    pub fn since(&self, revision: usize) -> &[Operation] {
        let start = revision.min(self.ops.len());
        return &self.ops[start..];
    }

    /// The log index of `client`'s most recent commit, if any.
    pub fn last_committed_by(&self, client: &C) -> Option<usize> {
        return self.last_by_client.get(client).copied();
    }

    /// Reset to revision 0. The per-client table resets with the history:
    /// after a snapshot reset every client starts over from revision 0.
    pub fn clear(&mut self) {
        self.ops.clear();
        self.last_by_client.clear();
    }
}
