//! The client-side acknowledgement state machine.
//!
//! Each connection keeps one of these per buffer. It enforces the one
//! rule that makes client/server OT tractable: at most one operation is
//! in flight at a time. Further local edits are composed into a buffer
//! and sent only once the outstanding operation is acknowledged.
//!
//! Methods return what the caller must do (a [`Submission`] to send, an
//! operation to apply locally) rather than invoking callbacks, so the
//! machine is a pure value the editor layer drives.

use super::{Operation, OtError};

/// An operation to send to the server, tagged with the revision the
/// client last saw.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    pub revision: usize,
    pub operation: Operation,
}

/// Where the client stands with respect to the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum State {
    /// No local operation awaits acknowledgement.
    Synchronized,
    /// One operation has been sent and not yet acknowledged.
    AwaitingConfirm { outstanding: Operation },
    /// An operation is in flight and later edits have piled up behind it.
    AwaitingWithBuffer {
        outstanding: Operation,
        buffered: Operation,
    },
}

/// Per-buffer client state: the acknowledgement machine plus the last
/// server revision this replica has incorporated.
#[derive(Clone, Debug)]
pub struct Client {
    revision: usize,
    state: State,
}

impl Default for Client {
    fn default() -> Client {
        return Client::new();
    }
}

impl Client {
    /// Create a synchronized client at revision 0.
    pub fn new() -> Client {
        return Client {
            revision: 0,
            state: State::Synchronized,
        };
    }

    /// The last server revision incorporated into the local document.
    pub fn revision(&self) -> usize {
        return self.revision;
    }

    /// The current acknowledgement state.
    pub fn state(&self) -> &State {
        return &self.state;
    }

    /// Record a local edit that has already been applied to the local
    /// document. Returns a [`Submission`] when the operation should be
    /// sent now; otherwise it is buffered behind the outstanding one.
    pub fn apply_local(&mut self, op: Operation) -> Result<Option<Submission>, OtError> {
        let state = std::mem::replace(&mut self.state, State::Synchronized);
        match state {
            State::Synchronized => {
                self.state = State::AwaitingConfirm { outstanding: op.clone() };
                return Ok(Some(Submission {
                    revision: self.revision,
                    operation: op,
                }));
            }
            State::AwaitingConfirm { outstanding } => {
                self.state = State::AwaitingWithBuffer {
                    outstanding,
                    buffered: op,
                };
                return Ok(None);
            }
            State::AwaitingWithBuffer { outstanding, buffered } => {
                let buffered = match buffered.compose(&op) {
                    Ok(buffered) => buffered,
                    Err(err) => {
                        // Restore the machine before surfacing the error.
                        self.state = State::AwaitingWithBuffer { outstanding, buffered };
                        return Err(err);
                    }
                };
                self.state = State::AwaitingWithBuffer { outstanding, buffered };
                return Ok(None);
            }
        }
    }

    /// Incorporate an operation the server committed on behalf of some
    /// other peer. Returns the operation to apply to the local document,
    /// transformed past anything local still in flight.
    pub fn apply_remote(&mut self, op: Operation) -> Result<Operation, OtError> {
        let state = std::mem::replace(&mut self.state, State::Synchronized);
        match state {
            State::Synchronized => {
                self.revision += 1;
                return Ok(op);
            }
            State::AwaitingConfirm { outstanding } => {
                match outstanding.transform(&op) {
                    Ok((outstanding, remote)) => {
                        self.revision += 1;
                        self.state = State::AwaitingConfirm { outstanding };
                        return Ok(remote);
                    }
                    Err(err) => {
                        self.state = State::AwaitingConfirm { outstanding };
                        return Err(err);
                    }
                }
            }
            State::AwaitingWithBuffer { outstanding, buffered } => {
                let transformed = outstanding
                    .transform(&op)
                    .and_then(|(outstanding, remote)| {
                        let (buffered, remote) = buffered.transform(&remote)?;
                        return Ok((outstanding, buffered, remote));
                    });
                match transformed {
                    Ok((outstanding, buffered, remote)) => {
                        self.revision += 1;
                        self.state = State::AwaitingWithBuffer { outstanding, buffered };
                        return Ok(remote);
                    }
                    Err(err) => {
                        self.state = State::AwaitingWithBuffer { outstanding, buffered };
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Handle the server's acknowledgement of our outstanding operation.
    /// Returns the buffered operation as a new [`Submission`] when one
    /// was waiting to go out.
    pub fn ack(&mut self) -> Result<Option<Submission>, OtError> {
        let state = std::mem::replace(&mut self.state, State::Synchronized);
        match state {
            State::Synchronized => {
                return Err(OtError::UnexpectedAck);
            }
            State::AwaitingConfirm { .. } => {
                self.revision += 1;
                return Ok(None);
            }
            State::AwaitingWithBuffer { buffered, .. } => {
                self.revision += 1;
                self.state = State::AwaitingConfirm {
                    outstanding: buffered.clone(),
                };
                return Ok(Some(Submission {
                    revision: self.revision,
                    operation: buffered,
                }));
            }
        }
    }

    /// Discard in-flight state and return to revision 0. Run when a full
    /// snapshot (SET_ALL / RESET) replaces the local document.
    pub fn reset(&mut self) {
        self.revision = 0;
        self.state = State::Synchronized;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::Server;

    #[test]
    fn local_edit_when_synchronized_is_sent() {
        let mut client = Client::new();
        let op = Operation::edit(0, 0, "a");
        let sent = client.apply_local(op.clone()).unwrap();
        assert_eq!(sent, Some(Submission { revision: 0, operation: op }));
        assert!(matches!(client.state(), State::AwaitingConfirm { .. }));
    }

    #[test]
    fn second_edit_is_buffered_not_sent() {
        let mut client = Client::new();
        client.apply_local(Operation::edit(0, 0, "a")).unwrap();
        let sent = client.apply_local(Operation::edit(1, 0, "b")).unwrap();
        assert_eq!(sent, None);
        assert!(matches!(client.state(), State::AwaitingWithBuffer { .. }));
    }

    #[test]
    fn further_edits_compose_into_the_buffer() {
        let mut client = Client::new();
        client.apply_local(Operation::edit(0, 0, "a")).unwrap();
        client.apply_local(Operation::edit(1, 0, "b")).unwrap();
        client.apply_local(Operation::edit(2, 0, "c")).unwrap();
        match client.state() {
            State::AwaitingWithBuffer { buffered, .. } => {
                assert_eq!(buffered.apply("a").unwrap(), "abc");
            }
            other => panic!("expected AwaitingWithBuffer, got {:?}", other),
        }
    }

    #[test]
    fn ack_releases_the_buffer() {
        let mut client = Client::new();
        client.apply_local(Operation::edit(0, 0, "a")).unwrap();
        client.apply_local(Operation::edit(1, 0, "b")).unwrap();
        let sent = client.ack().unwrap().expect("buffered op goes out");
        assert_eq!(sent.revision, 1);
        assert!(matches!(client.state(), State::AwaitingConfirm { .. }));
        assert_eq!(client.ack().unwrap(), None);
        assert_eq!(client.state(), &State::Synchronized);
        assert_eq!(client.revision(), 2);
    }

    #[test]
    fn ack_when_synchronized_is_an_error() {
        let mut client = Client::new();
        assert_eq!(client.ack().unwrap_err(), OtError::UnexpectedAck);
    }

    #[test]
    fn remote_op_is_transformed_past_outstanding() {
        // Local document "x" with an unacknowledged insert of "y" at 1.
        let mut client = Client::new();
        client.apply_local(Operation::edit(1, 0, "y")).unwrap();

        // Server committed someone else's insert of "A" at 0 first.
        let remote = client.apply_remote(Operation::edit(0, 0, "A")).unwrap();
        assert_eq!(remote.apply("xy").unwrap(), "Axy");
        assert_eq!(client.revision(), 1);
    }

    #[test]
    fn client_and_server_converge_through_a_race() {
        // A full round trip: two clients edit concurrently, the server
        // linearizes, and both replicas arrive at the same document.
        let mut server: Server<u8> = Server::new();
        let mut alice = Client::new();
        let mut bob = Client::new();
        let mut alice_doc = String::new();
        let mut bob_doc = String::new();

        // Alice types "ab"; Bob concurrently types "X". Both are against
        // revision 0.
        let a_op = Operation::edit(0, 0, "ab");
        alice_doc = a_op.apply(&alice_doc).unwrap();
        let a_sub = alice.apply_local(a_op).unwrap().unwrap();

        let b_op = Operation::edit(0, 0, "X");
        bob_doc = b_op.apply(&bob_doc).unwrap();
        let b_sub = bob.apply_local(b_op).unwrap().unwrap();

        // Server receives Alice first, then Bob.
        let a_commit = server.receive(1, a_sub.revision, a_sub.operation).unwrap().unwrap();
        let b_commit = server.receive(2, b_sub.revision, b_sub.operation).unwrap().unwrap();
        assert_eq!(server.document(), "Xab");

        // Alice: ack for her own commit, then Bob's op.
        alice.ack().unwrap();
        let for_alice = alice.apply_remote(b_commit).unwrap();
        alice_doc = for_alice.apply(&alice_doc).unwrap();

        // Bob: Alice's op arrives before his ack.
        let for_bob = bob.apply_remote(a_commit).unwrap();
        bob_doc = for_bob.apply(&bob_doc).unwrap();
        bob.ack().unwrap();

        assert_eq!(alice_doc, "Xab");
        assert_eq!(bob_doc, "Xab");
        assert_eq!(alice.revision(), server.revision());
        assert_eq!(bob.revision(), server.revision());
    }
}
