//! One shared buffer: the OT authority plus character attribution.
//!
//! Alongside the canonical text the buffer maintains `owners`, a string
//! of equal length mapping each character to the attribution character
//! of the peer that inserted it. Attribution is cosmetic: it feeds peer
//! colouring on clients and is never consulted for correctness.

use crate::ot::{Operation, OtError, Server};
use crate::protocol::{BufferSnapshot, PeerId, Target};

/// A shared text buffer owned by the session.
#[derive(Clone, Debug)]
pub struct SharedBuffer {
    target: Target,
    authority: Server<PeerId>,
    owners: String,
}

impl SharedBuffer {
    pub fn new(target: Target) -> SharedBuffer {
        return SharedBuffer {
            target,
            authority: Server::new(),
            owners: String::new(),
        };
    }

    pub fn target(&self) -> Target {
        return self.target;
    }

    pub fn text(&self) -> &str {
        return self.authority.document();
    }

    pub fn revision(&self) -> usize {
        return self.authority.revision();
    }

    /// Current character count of the canonical text.
    pub fn len(&self) -> usize {
        return self.authority.document().chars().count();
    }

    pub fn is_empty(&self) -> bool {
        return self.authority.document().is_empty();
    }

    /// Route an operation through the authority, then mirror the commit
    /// into the attribution string with the author's character.
    pub fn receive(
        &mut self,
        peer: PeerId,
        revision: usize,
        op: Operation,
    ) -> Result<Option<Operation>, OtError> {
        let Some(committed) = self.authority.receive(peer, revision, op)? else {
            return Ok(None);
        };

        let tag = peer.attribution_char().unwrap_or('?');
        let mut owner_op = Operation::new();
        for atom in committed.atoms() {
            match atom {
                crate::ot::Atom::Retain(n) => owner_op.retain(*n),
                crate::ot::Atom::Delete(n) => owner_op.delete(*n),
                crate::ot::Atom::Insert(s) => {
                    let run: String = std::iter::repeat(tag).take(s.chars().count()).collect();
                    owner_op.insert(&run);
                }
            }
        }
        self.owners = owner_op.apply(&self.owners)?;
        return Ok(Some(committed));
    }

    /// Full state for SET_ALL / RESET payloads.
    pub fn snapshot(&self) -> BufferSnapshot {
        return BufferSnapshot {
            target: self.target,
            text: self.authority.document().to_owned(),
            owners: self.owners.clone(),
        };
    }

    /// Drop revision history, keeping text and attribution.
    pub fn clear_history(&mut self) {
        self.authority.clear_history();
    }

    /// Compress the attribution string into `(peer, run length)` pairs.
    pub fn attribution_runs(&self) -> Vec<(PeerId, usize)> {
        let mut runs: Vec<(PeerId, usize)> = Vec::new();
        for c in self.owners.chars() {
            let id = PeerId::from_attribution_char(c).unwrap_or(PeerId::SERVER);
            match runs.last_mut() {
                Some((last, count)) if *last == id => *count += 1,
                _ => runs.push((id, 1)),
            }
        }
        return runs;
    }
}
