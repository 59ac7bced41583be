//! The peer registry and cursor tracker.
//!
//! Peers are created when their handshake is accepted and never deleted:
//! disconnecting only clears the `connected` flag, so a later connection
//! from the same (host, name) pair gets its old identity back instead of
//! a fresh allocation.

use rustc_hash::FxHashMap;

use crate::ot::Operation;
use crate::protocol::{PeerId, PeerLocation, Target, ERR_MAX_LOGINS, ERR_NAME_TAKEN, MAX_PEERS};

/// One registered participant.
#[derive(Clone, Debug)]
pub struct PeerState {
    pub id: PeerId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub connected: bool,
    /// The buffer this peer is editing.
    pub target: Target,
    /// Cursor offset into that buffer's text.
    pub index: usize,
    /// Selected range `[start, end)`, if any.
    pub selection: Option<(usize, usize)>,
}

impl PeerState {
    fn new(id: PeerId, host: &str, name: &str) -> PeerState {
        return PeerState {
            id,
            name: name.to_owned(),
            host: host.to_owned(),
            port: 0,
            connected: false,
            target: Target::FoxDot,
            index: 0,
            selection: None,
        };
    }

    fn location(&self) -> PeerLocation {
        return PeerLocation {
            id: self.id,
            name: self.name.clone(),
            connected: self.connected,
            target: self.target,
            index: self.index,
            selection: self.selection,
        };
    }
}

/// All peers the session has ever accepted, connected or not.
#[derive(Clone, Debug, Default)]
pub struct PeerTable {
    peers: FxHashMap<PeerId, PeerState>,
}

impl PeerTable {
    pub fn new() -> PeerTable {
        return PeerTable::default();
    }

    /// Find the identity for a connecting (host, name) pair.
    ///
    /// Reconnection wins: a disconnected peer with the same origin gets
    /// its old id back (second value `true`). The same pair still live is
    /// a name collision. Otherwise the smallest unused id is allocated;
    /// a full table is an exhaustion error.
    pub fn allocate(&mut self, host: &str, name: &str) -> Result<(PeerId, bool), i32> {
        if let Some(existing) = self
            .peers
            .values()
            .find(|peer| peer.host == host && peer.name == name)
        {
            if existing.connected {
                return Err(ERR_NAME_TAKEN);
            }
            return Ok((existing.id, true));
        }
        for n in 0..MAX_PEERS {
            let id = PeerId(n);
            if !self.peers.contains_key(&id) {
                self.peers.insert(id, PeerState::new(id, host, name));
                return Ok((id, false));
            }
        }
        return Err(ERR_MAX_LOGINS);
    }

    pub fn get(&self, id: PeerId) -> Option<&PeerState> {
        return self.peers.get(&id);
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut PeerState> {
        return self.peers.get_mut(&id);
    }

    /// Re-enable a peer on (re)connection, refreshing its announce data.
    pub fn mark_connected(&mut self, id: PeerId, name: &str, host: &str, port: u16) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.connected = true;
            peer.name = name.to_owned();
            peer.host = host.to_owned();
            peer.port = port;
        }
    }

    /// Degrade a peer to invisible-but-retained. Returns whether the
    /// peer was connected beforehand.
    pub fn mark_disconnected(&mut self, id: PeerId) -> bool {
        if let Some(peer) = self.peers.get_mut(&id) {
            let was = peer.connected;
            peer.connected = false;
            return was;
        }
        return false;
    }

    /// Ids of all currently connected peers, in id order.
    pub fn connected_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .peers
            .values()
            .filter(|peer| peer.connected)
            .map(|peer| peer.id)
            .collect();
        ids.sort();
        return ids;
    }

    /// Location snapshot of every known peer, in id order.
    pub fn locations(&self) -> Vec<PeerLocation> {
        let mut locations: Vec<PeerLocation> =
            self.peers.values().map(PeerState::location).collect();
        locations.sort_by_key(|loc| loc.id);
        return locations;
    }

    /// Move a peer's cursor, clearing any selection.
    pub fn set_location(&mut self, id: PeerId, target: Target, index: usize) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.target = target;
            peer.index = index;
            peer.selection = None;
        }
    }

    /// Record a peer's selection. An empty range is a de-select.
    pub fn set_selection(&mut self, id: PeerId, target: Target, start: usize, end: usize) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.target = target;
            let (start, end) = (start.min(end), start.max(end));
            peer.selection = if start == end { None } else { Some((start, end)) };
        }
    }

    /// Adjust every cursor and selection in `target` for a committed
    /// operation by `actor`. `new_len` is the document length after the
    /// operation.
    ///
    /// Every other peer's positions are mapped through a single monotone
    /// function of the edit: positions at or before the edit point stay,
    /// positions inside the deleted range collapse to the edit point,
    /// and positions past it shift by the net length delta. The actor's
    /// cursor moves to the caret the operation implies. The map depends
    /// only on the operation, so it is idempotent per commit and
    /// order-independent across uninvolved peers.
    pub fn adjust_for_operation(
        &mut self,
        target: Target,
        actor: PeerId,
        op: &Operation,
        new_len: usize,
    ) {
        let point = op.edit_start();
        let deleted = op.deleted_len();
        let delta = op.len_delta();
        let map = |x: usize| -> usize {
            let moved = if x <= point {
                x
            } else if x <= point + deleted {
                point
            } else {
                (x as isize + delta).max(0) as usize
            };
            return moved.min(new_len);
        };

        for peer in self.peers.values_mut() {
            if peer.target != target {
                continue;
            }
            if peer.id == actor {
                peer.index = op.caret_index().min(new_len);
                peer.selection = None;
                continue;
            }
            peer.index = map(peer.index);
            peer.selection = peer.selection.and_then(|(start, end)| {
                let (start, end) = (map(start), map(end));
                if start >= end {
                    return None;
                }
                return Some((start, end));
            });
        }
    }
}
