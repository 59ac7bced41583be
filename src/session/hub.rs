//! The session manager: handshakes, the join/leave barrier, and relay.
//!
//! The hub is a pure state machine. Every entry point returns the
//! packets the IO layer must deliver, keyed by destination peer, so the
//! whole protocol is unit-testable without a socket in sight. It owns
//! the peer table, the shared buffers, the barrier state, and the
//! counter for server-originated message ids; nothing here blocks.
//!
//! The join barrier is a stop-the-world sequence, not a symmetric
//! broadcast: while it is open, inbound operation and selection traffic
//! is deferred (queued, never relayed) so it is processed strictly after
//! the snapshot reset instead of interleaved with it.

use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, warn};

use super::buffer::SharedBuffer;
use super::peer::PeerTable;
use crate::protocol::{Message, Packet, PeerId, Target, ERR_LOGIN_FAIL};

/// The verdict on a handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Granted { id: PeerId, reconnect: bool },
    Rejected(i32),
}

impl HandshakeOutcome {
    /// The code written back as the fixed-width handshake reply.
    pub fn code(&self) -> i32 {
        match self {
            HandshakeOutcome::Granted { id, .. } => return id.0,
            HandshakeOutcome::Rejected(code) => return *code,
        }
    }
}

/// Packets to deliver, in order, keyed by destination.
pub type Outbox = Vec<(PeerId, Packet)>;

/// Session state shared by every connection.
#[derive(Debug)]
pub struct Hub {
    digest: String,
    peers: PeerTable,
    buffers: FxHashMap<Target, SharedBuffer>,
    waiting_for_ack: bool,
    acknowledged: FxHashSet<PeerId>,
    deferred: Vec<(PeerId, Packet)>,
    barrier_timeout: Duration,
    barrier_opened: Option<Instant>,
    next_msg_id: u64,
}

impl Hub {
    /// Create a hub guarding `digest` (the expected secret digest) with
    /// the given barrier timeout.
    pub fn new(digest: String, barrier_timeout: Duration) -> Hub {
        let buffers = Target::ALL
            .into_iter()
            .map(|target| (target, SharedBuffer::new(target)))
            .collect();
        return Hub {
            digest,
            peers: PeerTable::new(),
            buffers,
            waiting_for_ack: false,
            acknowledged: FxHashSet::default(),
            deferred: Vec::new(),
            barrier_timeout,
            barrier_opened: None,
            next_msg_id: 0,
        };
    }

    /// Authenticate a connecting peer. No session state is touched on a
    /// wrong digest; allocation only registers the identity, connection
    /// happens when the CONNECT message arrives.
    pub fn handshake(&mut self, host: &str, name: &str, digest: &str) -> HandshakeOutcome {
        if digest != self.digest {
            warn!(host, name, "login failure: bad secret digest");
            return HandshakeOutcome::Rejected(ERR_LOGIN_FAIL);
        }
        match self.peers.allocate(host, name) {
            Ok((id, reconnect)) => {
                info!(%id, host, name, reconnect, "handshake accepted");
                return HandshakeOutcome::Granted { id, reconnect };
            }
            Err(code) => {
                warn!(host, name, code, "handshake rejected");
                return HandshakeOutcome::Rejected(code);
            }
        }
    }

    /// True while the join barrier is holding back ordinary traffic.
    pub fn barrier_open(&self) -> bool {
        return self.waiting_for_ack;
    }

    /// The instant the open barrier times out, if one is open.
    pub fn barrier_deadline(&self) -> Option<Instant> {
        return self.barrier_opened.map(|opened| opened + self.barrier_timeout);
    }

    /// Currently connected peer ids.
    pub fn connected_ids(&self) -> Vec<PeerId> {
        return self.peers.connected_ids();
    }

    pub fn is_connected(&self, id: PeerId) -> bool {
        return self.peers.get(id).is_some_and(|peer| peer.connected);
    }

    /// Buffer access for tests and diagnostics.
    pub fn buffer(&self, target: Target) -> Option<&SharedBuffer> {
        return self.buffers.get(&target);
    }

    /// Process one inbound packet from `id`. The connection id is
    /// authoritative; a mismatched `src` field is ignored in favour of it.
    pub fn message(&mut self, id: PeerId, packet: Packet) -> Outbox {
        if let Message::Connect { name, host, port, .. } = &packet.body {
            let (name, host, port) = (name.clone(), host.clone(), *port);
            return self.connect(id, &name, &host, port);
        }

        if self.waiting_for_ack {
            if matches!(packet.body, Message::ConnectAck { .. }) {
                return self.connect_ack(id);
            }
            // Everything else waits out the barrier.
            debug!(%id, "deferring packet until the barrier closes");
            self.deferred.push((id, packet));
            return Vec::new();
        }

        return self.relay_message(id, packet);
    }

    /// Open the join barrier for a newly connected peer.
    ///
    /// In order: mark the peer connected; fan out its CONNECT to every
    /// connected peer (itself included) and every existing peer's
    /// CONNECT back to it; clear every buffer's history (revisions
    /// preceding a join are irrelevant to the snapshot everyone is about
    /// to receive); then demand acknowledgement from the whole session.
    fn connect(&mut self, id: PeerId, name: &str, host: &str, port: u16) -> Outbox {
        info!(%id, name, host, port, "peer connecting, opening join barrier");
        self.peers.mark_connected(id, name, host, port);

        let mut out = Vec::new();
        let connected = self.peers.connected_ids();

        let announce = Message::Connect {
            src: id,
            name: name.to_owned(),
            host: host.to_owned(),
            port,
        };
        for &dest in &connected {
            out.push((dest, self.packet(announce.clone())));
        }
        for &existing in &connected {
            if existing == id {
                continue;
            }
            if let Some(peer) = self.peers.get(existing) {
                let body = Message::Connect {
                    src: existing,
                    name: peer.name.clone(),
                    host: peer.host.clone(),
                    port: peer.port,
                };
                out.push((id, self.packet(body)));
            }
        }

        // The newcomer gets the current state straight away; the closing
        // RESET then realigns everyone, newcomer included.
        let (buffers, peer_locations) = self.snapshot();
        let set_all = Message::SetAll {
            src: PeerId::SERVER,
            buffers,
            peers: peer_locations,
        };
        out.push((id, self.packet(set_all)));

        for buffer in self.buffers.values_mut() {
            buffer.clear_history();
        }

        self.waiting_for_ack = true;
        self.acknowledged.clear();
        self.barrier_opened = Some(Instant::now());
        for &dest in &connected {
            out.push((dest, self.packet(Message::RequestAck { src: PeerId::SERVER, flag: 1 })));
        }
        return out;
    }

    /// Tally one CONNECT_ACK; closing the barrier once every connected
    /// peer has answered.
    fn connect_ack(&mut self, id: PeerId) -> Outbox {
        debug!(%id, "barrier acknowledgement");
        self.acknowledged.insert(id);
        return self.try_close_barrier();
    }

    fn barrier_complete(&self) -> bool {
        return self
            .peers
            .connected_ids()
            .iter()
            .all(|id| self.acknowledged.contains(id));
    }

    /// Close the barrier if every connected peer has acknowledged: send
    /// everyone the full snapshot, reopen relaying, then drain whatever
    /// was deferred. Deferred operations were authored against revisions
    /// that no longer exist, so they die on the duplicate guard or the
    /// length check rather than corrupting the fresh state.
    fn try_close_barrier(&mut self) -> Outbox {
        if !self.waiting_for_ack || !self.barrier_complete() {
            return Vec::new();
        }
        info!("join barrier complete, broadcasting snapshot");
        self.waiting_for_ack = false;
        self.barrier_opened = None;
        self.acknowledged.clear();

        let mut out = Vec::new();
        let (buffers, peers) = self.snapshot();
        let reset = Message::Reset { src: PeerId::SERVER, buffers, peers };
        for dest in self.peers.connected_ids() {
            out.push((dest, self.packet(reset.clone())));
            out.push((dest, self.packet(Message::RequestAck { src: PeerId::SERVER, flag: 0 })));
        }

        for (origin, packet) in std::mem::take(&mut self.deferred) {
            out.extend(self.relay_message(origin, packet));
        }
        return out;
    }

    /// Relay one packet outside the barrier.
    fn relay_message(&mut self, id: PeerId, packet: Packet) -> Outbox {
        if !self.is_connected(id) {
            debug!(%id, "dropping packet from disconnected peer");
            return Vec::new();
        }
        let Packet { msg_id, body } = packet;
        match body {
            Message::Connect { .. } | Message::ConnectAck { .. } => {
                // Connect is handled before relay; a stray ack outside
                // the barrier carries no information.
                return Vec::new();
            }
            Message::Operation { target, ops, revision, reply, .. } => {
                return self.handle_operation(id, msg_id, target, ops, revision, reply);
            }
            Message::SetMark { target, index, reply, .. } => {
                self.peers.set_location(id, target, index);
                let body = Message::SetMark { src: id, target, index, reply };
                return self.relay(id, Packet { msg_id, body }, reply);
            }
            Message::Select { target, start, end, reply, .. } => {
                self.peers.set_selection(id, target, start, end);
                let body = Message::Select { src: id, target, start, end, reply };
                return self.relay(id, Packet { msg_id, body }, reply);
            }
            Message::EvaluateBlock { target, start_line, end_line, reply, .. } => {
                // Opaque to the core: clients run the interpreters.
                let body = Message::EvaluateBlock { src: id, target, start_line, end_line, reply };
                return self.relay(id, Packet { msg_id, body }, reply);
            }
            Message::EvaluateString { target, string, reply, .. } => {
                let body = Message::EvaluateString { src: id, target, string, reply };
                return self.relay(id, Packet { msg_id, body }, reply);
            }
            Message::Response { string, .. } => {
                let body = Message::Response { src: id, string };
                return self.relay(id, Packet { msg_id, body }, true);
            }
            other if other.server_only() => {
                warn!(%id, "client sent a server-only message type, dropping");
                return Vec::new();
            }
            _ => return Vec::new(),
        }
    }

    /// Route an operation through its buffer's authority and rebroadcast
    /// the committed form. The echo back to the origin (when `reply` is
    /// set) is the acknowledgement that drives the client state machine.
    fn handle_operation(
        &mut self,
        id: PeerId,
        msg_id: u64,
        target: Target,
        ops: crate::ot::Operation,
        revision: usize,
        reply: bool,
    ) -> Outbox {
        let Some(buffer) = self.buffers.get_mut(&target) else {
            return Vec::new();
        };
        match buffer.receive(id, revision, ops) {
            Ok(Some(committed)) => {
                let new_len = buffer.len();
                let new_revision = buffer.revision();
                self.peers.adjust_for_operation(target, id, &committed, new_len);
                debug!(%id, %target, revision = new_revision, "operation committed");
                let body = Message::Operation {
                    src: id,
                    target,
                    ops: committed,
                    revision: new_revision,
                    reply,
                };
                return self.relay(id, Packet { msg_id, body }, reply);
            }
            Ok(None) => {
                // Stale resubmission: at-most-once commit per client per
                // revision window. Silence, not an error.
                debug!(%id, %target, revision, "stale operation dropped");
                return Vec::new();
            }
            Err(err) => {
                warn!(%id, %target, revision, %err, "rejecting malformed operation, evicting peer");
                return self.drop_peer(id);
            }
        }
    }

    /// Deliver to every connected peer, skipping the origin unless the
    /// message asked for its echo.
    fn relay(&self, origin: PeerId, packet: Packet, reply: bool) -> Outbox {
        let mut out = Vec::new();
        for dest in self.peers.connected_ids() {
            if dest != origin || reply {
                out.push((dest, packet.clone()));
            }
        }
        return out;
    }

    /// Remove a peer from the session: mark it disconnected and tell the
    /// others. If a barrier is open the peer can no longer acknowledge,
    /// so completion is re-checked; otherwise the membership change
    /// clears every revision log and everyone resynchronizes from a
    /// fresh snapshot.
    pub fn drop_peer(&mut self, id: PeerId) -> Outbox {
        if !self.peers.mark_disconnected(id) {
            return Vec::new();
        }
        info!(%id, "peer removed");
        self.acknowledged.remove(&id);

        let remove = self.packet(Message::Remove { src: id });
        let mut out = self.relay(id, remove, false);
        if self.waiting_for_ack {
            out.extend(self.try_close_barrier());
            return out;
        }

        for buffer in self.buffers.values_mut() {
            buffer.clear_history();
        }
        let (buffers, peers) = self.snapshot();
        let reset = Message::Reset { src: PeerId::SERVER, buffers, peers };
        for dest in self.peers.connected_ids() {
            out.push((dest, self.packet(reset.clone())));
        }
        return out;
    }

    /// Evict every peer still holding the barrier open past its
    /// deadline, letting the join complete for the peers that answered.
    pub fn barrier_timed_out(&mut self) -> Outbox {
        if !self.waiting_for_ack {
            return Vec::new();
        }
        let silent: Vec<PeerId> = self
            .peers
            .connected_ids()
            .into_iter()
            .filter(|id| !self.acknowledged.contains(id))
            .collect();
        warn!(?silent, "join barrier timed out, evicting unresponsive peers");
        let mut out = Vec::new();
        for id in silent {
            out.extend(self.drop_peer(id));
        }
        return out;
    }

    /// KILL every connected peer ahead of server shutdown.
    pub fn shutdown(&mut self, reason: &str) -> Outbox {
        let body = Message::Kill {
            src: PeerId::SERVER,
            string: reason.to_owned(),
        };
        let mut out = Vec::new();
        for dest in self.peers.connected_ids() {
            out.push((dest, self.packet(body.clone())));
        }
        return out;
    }

    /// Full session snapshot: every buffer's canonical state and every
    /// known peer's location.
    fn snapshot(&self) -> (Vec<crate::protocol::BufferSnapshot>, Vec<crate::protocol::PeerLocation>) {
        let mut buffers: Vec<_> = self.buffers.values().map(SharedBuffer::snapshot).collect();
        buffers.sort_by_key(|snapshot| snapshot.target);
        return (buffers, self.peers.locations());
    }

    fn packet(&mut self, body: Message) -> Packet {
        let msg_id = self.next_msg_id;
        self.next_msg_id += 1;
        return Packet { msg_id, body };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::Operation;
    use crate::protocol::secret_digest;

    fn hub() -> Hub {
        return Hub::new(secret_digest(""), Duration::from_secs(30));
    }

    fn join(hub: &mut Hub, name: &str) -> PeerId {
        let outcome = hub.handshake("10.0.0.1", name, &secret_digest(""));
        let HandshakeOutcome::Granted { id, .. } = outcome else {
            panic!("handshake rejected: {:?}", outcome);
        };
        let connect = Message::Connect {
            src: id,
            name: name.to_owned(),
            host: "10.0.0.1".to_owned(),
            port: 4000 + id.0 as u16,
        };
        hub.message(id, Packet { msg_id: 0, body: connect });
        // Every connected peer acknowledges the barrier.
        for peer in hub.connected_ids() {
            hub.message(peer, Packet { msg_id: 0, body: Message::ConnectAck { src: peer } });
        }
        assert!(!hub.barrier_open());
        return id;
    }

    fn operation_packet(src: PeerId, revision: usize, op: Operation) -> Packet {
        return Packet {
            msg_id: 1,
            body: Message::Operation {
                src,
                target: Target::FoxDot,
                ops: op,
                revision,
                reply: true,
            },
        };
    }

    #[test]
    fn wrong_digest_is_rejected_without_state() {
        let mut hub = hub();
        let outcome = hub.handshake("h", "alice", &secret_digest("wrong"));
        assert_eq!(outcome, HandshakeOutcome::Rejected(ERR_LOGIN_FAIL));
        assert!(hub.connected_ids().is_empty());
    }

    #[test]
    fn join_announces_existing_peers_to_the_newcomer() {
        let mut hub = hub();
        let alice = join(&mut hub, "alice");

        let outcome = hub.handshake("10.0.0.2", "bob", &secret_digest(""));
        let HandshakeOutcome::Granted { id: bob, .. } = outcome else {
            panic!("expected grant");
        };
        let connect = Message::Connect {
            src: bob,
            name: "bob".into(),
            host: "10.0.0.2".into(),
            port: 4001,
        };
        let out = hub.message(bob, Packet { msg_id: 0, body: connect });

        // Bob's CONNECT reaches both peers, alice's CONNECT reaches bob,
        // and everyone gets the ack request.
        let bob_connects = out
            .iter()
            .filter(|(_, p)| matches!(&p.body, Message::Connect { src, .. } if *src == bob))
            .count();
        assert_eq!(bob_connects, 2);
        assert!(out.iter().any(|(dest, p)| {
            return *dest == bob
                && matches!(&p.body, Message::Connect { src, .. } if *src == alice);
        }));
        let ack_requests = out
            .iter()
            .filter(|(_, p)| matches!(&p.body, Message::RequestAck { flag: 1, .. }))
            .count();
        assert_eq!(ack_requests, 2);
        assert!(hub.barrier_open());
    }

    #[test]
    fn barrier_defers_operations_until_reset() {
        let mut hub = hub();
        let alice = join(&mut hub, "alice");
        hub.message(alice, operation_packet(alice, 0, Operation::edit(0, 0, "live")));

        // Bob starts joining: barrier opens.
        let HandshakeOutcome::Granted { id: bob, .. } =
            hub.handshake("10.0.0.2", "bob", &secret_digest(""))
        else {
            panic!("expected grant");
        };
        let connect = Message::Connect {
            src: bob,
            name: "bob".into(),
            host: "10.0.0.2".into(),
            port: 4001,
        };
        hub.message(bob, Packet { msg_id: 0, body: connect });

        // Alice keeps typing mid-join; nothing may be relayed.
        let out = hub.message(alice, operation_packet(alice, 1, Operation::edit(4, 0, "!")));
        assert!(out.is_empty());

        // Acks arrive. The close emits RESET and RequestAck(0) before
        // any deferred operation traffic.
        hub.message(alice, Packet { msg_id: 0, body: Message::ConnectAck { src: alice } });
        let out = hub.message(bob, Packet { msg_id: 0, body: Message::ConnectAck { src: bob } });
        assert!(!hub.barrier_open());

        let first_reset = out
            .iter()
            .position(|(_, p)| matches!(&p.body, Message::Reset { .. }))
            .expect("reset broadcast");
        let first_op = out
            .iter()
            .position(|(_, p)| matches!(&p.body, Message::Operation { .. }));
        if let Some(first_op) = first_op {
            assert!(first_reset < first_op);
        }

        // The snapshot carries the pre-join text, and history restarted
        // from revision 0.
        let (_, reset) = &out[first_reset];
        let Message::Reset { buffers, .. } = &reset.body else {
            panic!("expected reset");
        };
        let fox = buffers.iter().find(|b| b.target == Target::FoxDot).unwrap();
        assert_eq!(fox.text, "live");
        // Alice's deferred op was authored against a cleared history; it
        // must not have produced a second revision beyond its commit.
        assert!(hub.buffer(Target::FoxDot).unwrap().revision() <= 1);
    }

    #[test]
    fn operation_is_committed_and_echoed() {
        let mut hub = hub();
        let alice = join(&mut hub, "alice");
        let bob = join(&mut hub, "bob");

        let out = hub.message(alice, operation_packet(alice, 0, Operation::edit(0, 0, "hi")));
        assert_eq!(hub.buffer(Target::FoxDot).unwrap().text(), "hi");
        // Echoed to alice (the ack) and relayed to bob.
        assert!(out.iter().any(|(dest, _)| *dest == alice));
        assert!(out.iter().any(|(dest, _)| *dest == bob));
        match &out[0].1.body {
            Message::Operation { revision, .. } => assert_eq!(*revision, 1),
            other => panic!("expected operation, got {:?}", other),
        }
    }

    #[test]
    fn concurrent_inserts_converge_to_the_transformed_text() {
        let mut hub = hub();
        let alice = join(&mut hub, "alice");
        let bob = join(&mut hub, "bob");

        hub.message(alice, operation_packet(alice, 0, Operation::edit(0, 0, "ab")));
        let out = hub.message(bob, operation_packet(bob, 0, Operation::edit(0, 0, "X")));
        assert_eq!(hub.buffer(Target::FoxDot).unwrap().text(), "Xab");
        // The broadcast carries the transformed operation.
        let (_, packet) = out
            .iter()
            .find(|(dest, _)| *dest == alice)
            .expect("relay to alice");
        let Message::Operation { ops, revision, .. } = &packet.body else {
            panic!("expected operation");
        };
        assert_eq!(*revision, 2);
        assert_eq!(ops.apply("ab").unwrap(), "Xab");
    }

    #[test]
    fn malformed_operation_evicts_the_sender() {
        let mut hub = hub();
        let alice = join(&mut hub, "alice");
        let bob = join(&mut hub, "bob");

        let out = hub.message(bob, operation_packet(bob, 0, Operation::edit(0, 50, "")));
        assert!(!hub.is_connected(bob));
        assert!(hub.is_connected(alice));
        assert!(out
            .iter()
            .any(|(dest, p)| *dest == alice
                && matches!(&p.body, Message::Remove { src } if *src == bob)));
    }

    #[test]
    fn set_mark_updates_location_and_skips_origin_without_reply() {
        let mut hub = hub();
        let alice = join(&mut hub, "alice");
        let _bob = join(&mut hub, "bob");

        let body = Message::SetMark {
            src: alice,
            target: Target::Tidal,
            index: 3,
            reply: false,
        };
        let out = hub.message(alice, Packet { msg_id: 5, body });
        assert!(out.iter().all(|(dest, _)| *dest != alice));
        assert_eq!(out.len(), 1);
        let peer = hub_peer(&hub, alice);
        assert_eq!((peer.target, peer.index), (Target::Tidal, 3));
    }

    fn hub_peer(hub: &Hub, id: PeerId) -> crate::session::peer::PeerState {
        return hub.peers.get(id).cloned().expect("peer registered");
    }

    #[test]
    fn leave_resets_history_and_notifies() {
        let mut hub = hub();
        let alice = join(&mut hub, "alice");
        let bob = join(&mut hub, "bob");
        hub.message(alice, operation_packet(alice, 0, Operation::edit(0, 0, "text")));

        let out = hub.drop_peer(bob);
        assert!(!hub.is_connected(bob));
        assert_eq!(hub.buffer(Target::FoxDot).unwrap().revision(), 0);
        assert!(out
            .iter()
            .any(|(_, p)| matches!(&p.body, Message::Remove { src } if *src == bob)));
        assert!(out
            .iter()
            .any(|(dest, p)| *dest == alice && matches!(&p.body, Message::Reset { .. })));
        // Dropping again is a no-op.
        assert!(hub.drop_peer(bob).is_empty());
    }

    #[test]
    fn evicting_a_silent_peer_completes_the_barrier() {
        let mut hub = hub();
        let alice = join(&mut hub, "alice");

        let HandshakeOutcome::Granted { id: bob, .. } =
            hub.handshake("10.0.0.2", "bob", &secret_digest(""))
        else {
            panic!("expected grant");
        };
        let connect = Message::Connect {
            src: bob,
            name: "bob".into(),
            host: "10.0.0.2".into(),
            port: 4001,
        };
        hub.message(bob, Packet { msg_id: 0, body: connect });
        hub.message(bob, Packet { msg_id: 1, body: Message::ConnectAck { src: bob } });
        assert!(hub.barrier_open());

        // Alice never acknowledges; the deadline evicts her and the join
        // completes for bob.
        let out = hub.barrier_timed_out();
        assert!(!hub.barrier_open());
        assert!(!hub.is_connected(alice));
        assert!(out
            .iter()
            .any(|(dest, p)| *dest == bob && matches!(&p.body, Message::Reset { .. })));
    }

    #[test]
    fn client_sent_server_types_are_dropped() {
        let mut hub = hub();
        let alice = join(&mut hub, "alice");
        let _bob = join(&mut hub, "bob");
        let body = Message::Kill { src: alice, string: "nope".into() };
        assert!(hub.message(alice, Packet { msg_id: 1, body }).is_empty());
    }

    #[test]
    fn shutdown_kills_every_connected_peer() {
        let mut hub = hub();
        let _alice = join(&mut hub, "alice");
        let _bob = join(&mut hub, "bob");
        let out = hub.shutdown("server going down");
        assert_eq!(out.len(), 2);
        assert!(out
            .iter()
            .all(|(_, p)| matches!(&p.body, Message::Kill { .. })));
    }
}
