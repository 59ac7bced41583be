//! Property tests for the operation algebra and the server authority.

use ensemble::ot::{Client, Operation, Server};
use proptest::prelude::*;

/// Documents mixing ASCII and multi-byte characters so every property
/// also checks that lengths count characters, not bytes.
fn doc_strategy() -> impl Strategy<Value = String> {
    return "[a-z πλé]{0,40}";
}

/// A random well-formed operation against a document of `len` chars:
/// a walk of retains, deletes, and inserts whose consumed length never
/// exceeds the document.
fn op_strategy(len: usize) -> impl Strategy<Value = Operation> {
    let step = (0..3usize, 1..5usize, "[A-Zδ]{0,3}");
    return proptest::collection::vec(step, 0..8).prop_map(move |steps| {
        let mut op = Operation::new();
        let mut remaining = len;
        for (kind, n, text) in steps {
            match kind {
                0 => {
                    let n = n.min(remaining);
                    op.retain(n);
                    remaining -= n;
                }
                1 => {
                    let n = n.min(remaining);
                    op.delete(n);
                    remaining -= n;
                }
                _ => op.insert(&text),
            }
        }
        op.trim();
        return op;
    });
}

fn doc_and_op() -> impl Strategy<Value = (String, Operation)> {
    return doc_strategy()
        .prop_flat_map(|doc| {
            let len = doc.chars().count();
            return (Just(doc), op_strategy(len));
        });
}

fn doc_and_two_ops() -> impl Strategy<Value = (String, Operation, Operation)> {
    return doc_strategy().prop_flat_map(|doc| {
        let len = doc.chars().count();
        return (Just(doc), op_strategy(len), op_strategy(len));
    });
}

/// A document, an operation on it, and an operation on the result.
fn doc_and_sequential_ops() -> impl Strategy<Value = (String, Operation, Operation)> {
    return doc_and_op().prop_flat_map(|(doc, a)| {
        let mid_len = a
            .apply(&doc)
            .map(|mid| mid.chars().count())
            .unwrap_or_default();
        return (Just(doc), Just(a), op_strategy(mid_len));
    });
}

proptest! {
    /// Transforming two concurrent operations yields a convergent pair:
    /// both application orders produce the same document.
    #[test]
    fn transform_converges((doc, a, b) in doc_and_two_ops()) {
        let (a_prime, b_prime) = a.transform(&b).unwrap();
        let via_a = b_prime.apply(&a.apply(&doc).unwrap()).unwrap();
        let via_b = a_prime.apply(&b.apply(&doc).unwrap()).unwrap();
        prop_assert_eq!(via_a, via_b);
    }

    /// Applying an operation and then its inverse restores the document.
    #[test]
    fn invert_round_trips((doc, op) in doc_and_op()) {
        let after = op.apply(&doc).unwrap();
        let inverse = op.invert(&doc).unwrap();
        prop_assert_eq!(inverse.apply(&after).unwrap(), doc);
    }

    /// Composing two sequential operations equals applying them in turn.
    #[test]
    fn compose_matches_sequential_application((doc, a, b) in doc_and_sequential_ops()) {
        let mid = a.apply(&doc).unwrap();
        let fused = a.compose(&b).unwrap();
        prop_assert_eq!(fused.apply(&doc).unwrap(), b.apply(&mid).unwrap());
    }

    /// Rebuilding an operation from its own atoms changes nothing:
    /// normalization is idempotent.
    #[test]
    fn normalization_is_idempotent((_, op) in doc_and_op()) {
        let rebuilt = Operation::from_atoms(op.atoms().iter().cloned());
        prop_assert_eq!(&rebuilt, &op);
        let again = Operation::from_atoms(rebuilt.atoms().iter().cloned());
        prop_assert_eq!(again, rebuilt);
    }

    /// Every accepted commit advances the server revision by exactly one
    /// and resubmitting an old operation commits nothing.
    #[test]
    fn server_revision_is_monotonic((doc, op) in doc_and_op()) {
        let mut server: Server<u8> = Server::new();
        server.reset(doc);
        prop_assert_eq!(server.revision(), 0);

        let committed = server.receive(1, 0, op.clone()).unwrap();
        prop_assert!(committed.is_some());
        prop_assert_eq!(server.revision(), 1);
        let after_first = server.document().to_owned();

        // The duplicate guard holds at the revision-0 edge too.
        prop_assert_eq!(server.receive(1, 0, op).unwrap(), None);
        prop_assert_eq!(server.revision(), 1);
        prop_assert_eq!(server.document(), after_first);
    }

    /// A full two-client race through the server converges on every
    /// replica, whatever the concurrent edits were.
    #[test]
    fn random_race_converges((doc, a_op, b_op) in doc_and_two_ops()) {
        let mut server: Server<u8> = Server::new();
        server.reset(doc.clone());
        let mut alice = Client::new();
        let mut bob = Client::new();
        let mut alice_doc = doc.clone();
        let mut bob_doc = doc;

        alice_doc = a_op.apply(&alice_doc).unwrap();
        let a_sub = alice.apply_local(a_op).unwrap().unwrap();
        bob_doc = b_op.apply(&bob_doc).unwrap();
        let b_sub = bob.apply_local(b_op).unwrap().unwrap();

        let a_commit = server
            .receive(1, a_sub.revision, a_sub.operation)
            .unwrap()
            .unwrap();
        let b_commit = server
            .receive(2, b_sub.revision, b_sub.operation)
            .unwrap()
            .unwrap();

        alice.ack().unwrap();
        let for_alice = alice.apply_remote(b_commit).unwrap();
        alice_doc = for_alice.apply(&alice_doc).unwrap();

        let for_bob = bob.apply_remote(a_commit).unwrap();
        bob_doc = for_bob.apply(&bob_doc).unwrap();
        bob.ack().unwrap();

        prop_assert_eq!(&alice_doc, server.document());
        prop_assert_eq!(&bob_doc, server.document());
        prop_assert_eq!(alice.revision(), server.revision());
        prop_assert_eq!(bob.revision(), server.revision());
    }
}
