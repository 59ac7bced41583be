//! Text operations: the unit of change exchanged between replicas.
//!
//! An operation is a normalized sequence of atoms (retain/insert/delete)
//! describing one edit as a left-to-right walk over the document. Key
//! design decisions:
//!
//! 1. **Normalization at construction**: adjacent atoms of the same kind
//!    are merged, zero-length atoms are dropped, and inserts sort before
//!    an adjacent delete, so two operations describing the same edit
//!    always have the same atom sequence.
//!
//! 2. **Implicit right edge**: a trailing pure-retain atom is trimmed.
//!    The algebra pads operations back out to a common base length before
//!    transforming or composing them, so trimmed operations stay valid
//!    against any document at least `base_len` characters long.
//!
//! 3. **Char counts, not bytes**: all lengths are measured in `char`s so
//!    multi-byte text never splits an atom mid-scalar.

use smallvec::SmallVec;

use super::OtError;

/// One step of an operation's walk over the document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Atom {
    /// Skip the next `n` characters unchanged.
    Retain(usize),
    /// Insert the string at the current position.
    Insert(String),
    /// Remove the next `n` characters.
    Delete(usize),
}

/// A normalized edit. Most real edits are a retain, an insert or delete,
/// and a trailing retain (trimmed), hence the inline capacity of 4.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Operation {
    atoms: SmallVec<[Atom; 4]>,
    /// Characters consumed from the input document.
    base_len: usize,
    /// Characters produced in the output document.
    target_len: usize,
}

/// Splits a string after `n` characters.
fn split_chars(s: &str, n: usize) -> (&str, &str) {
    match s.char_indices().nth(n) {
        Some((byte, _)) => s.split_at(byte),
        None => (s, ""),
    }
}

fn chars(s: &str) -> usize {
    return s.chars().count();
}

impl Operation {
    /// Create an empty operation (a no-op against the empty document).
    pub fn new() -> Operation {
        return Operation::default();
    }

    /// Build a normalized operation from an atom sequence.
    pub fn from_atoms<I: IntoIterator<Item = Atom>>(atoms: I) -> Operation {
        let mut op = Operation::new();
        for atom in atoms {
            match atom {
                Atom::Retain(n) => op.retain(n),
                Atom::Insert(s) => op.insert(&s),
                Atom::Delete(n) => op.delete(n),
            }
        }
        op.trim();
        return op;
    }

    /// Build the operation for a single edit: delete `deleted` characters
    /// at `index`, then insert `inserted` there.
    pub fn edit(index: usize, deleted: usize, inserted: &str) -> Operation {
        let mut op = Operation::new();
        op.retain(index);
        op.delete(deleted);
        op.insert(inserted);
        return op;
    }

    /// Append a retain atom, merging with a trailing retain.
    pub fn retain(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.base_len += n;
        self.target_len += n;
        if let Some(Atom::Retain(last)) = self.atoms.last_mut() {
            *last += n;
        } else {
            self.atoms.push(Atom::Retain(n));
        }
    }

    /// Append an insert atom. An insert adjacent to a delete is ordered
    /// before it so equal edits normalize to equal atom sequences.
    pub fn insert(&mut self, s: &str) {
        if s.is_empty() {
            return;
        }
        self.target_len += chars(s);
        match self.atoms.pop() {
            Some(Atom::Insert(mut last)) => {
                last.push_str(s);
                self.atoms.push(Atom::Insert(last));
            }
            Some(Atom::Delete(d)) => match self.atoms.pop() {
                Some(Atom::Insert(mut prev)) => {
                    prev.push_str(s);
                    self.atoms.push(Atom::Insert(prev));
                    self.atoms.push(Atom::Delete(d));
                }
                Some(other) => {
                    self.atoms.push(other);
                    self.atoms.push(Atom::Insert(s.to_owned()));
                    self.atoms.push(Atom::Delete(d));
                }
                None => {
                    self.atoms.push(Atom::Insert(s.to_owned()));
                    self.atoms.push(Atom::Delete(d));
                }
            },
            Some(other) => {
                self.atoms.push(other);
                self.atoms.push(Atom::Insert(s.to_owned()));
            }
            None => self.atoms.push(Atom::Insert(s.to_owned())),
        }
    }

    /// Append a delete atom, merging with a trailing delete.
    pub fn delete(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.base_len += n;
        if let Some(Atom::Delete(last)) = self.atoms.last_mut() {
            *last += n;
        } else {
            self.atoms.push(Atom::Delete(n));
        }
    }

    /// Remove a trailing retain atom. The right edge of the document is
    /// implicit; the algebra pads it back in when lengths must line up.
    pub fn trim(&mut self) {
        if let Some(Atom::Retain(n)) = self.atoms.last() {
            self.base_len -= n;
            self.target_len -= n;
            self.atoms.pop();
        }
    }

    /// Extend with a trailing retain until `base_len` reaches `base`.
    pub fn pad_to(&mut self, base: usize) {
        if base > self.base_len {
            self.retain(base - self.base_len);
        }
    }

    /// Characters the operation consumes from its input document.
    pub fn base_len(&self) -> usize {
        return self.base_len;
    }

    /// Characters the operation produces in its output document.
    pub fn target_len(&self) -> usize {
        return self.target_len;
    }

    /// The atom sequence.
    pub fn atoms(&self) -> &[Atom] {
        return &self.atoms;
    }

    /// True if applying the operation changes nothing.
    pub fn is_noop(&self) -> bool {
        return self.atoms.iter().all(|atom| matches!(atom, Atom::Retain(_)));
    }

    /// Net length change: characters inserted minus characters deleted.
    pub fn len_delta(&self) -> isize {
        return self.inserted_len() as isize - self.deleted_len() as isize;
    }

    /// Total characters inserted.
    pub fn inserted_len(&self) -> usize {
        let mut total = 0;
        for atom in &self.atoms {
            if let Atom::Insert(s) = atom {
                total += chars(s);
            }
        }
        return total;
    }

    /// Total characters deleted.
    pub fn deleted_len(&self) -> usize {
        let mut total = 0;
        for atom in &self.atoms {
            if let Atom::Delete(n) = atom {
                total += n;
            }
        }
        return total;
    }

    /// The index where the edit takes effect: the leading retain count.
    pub fn edit_start(&self) -> usize {
        if let Some(Atom::Retain(n)) = self.atoms.first() {
            return *n;
        }
        return 0;
    }

    /// The caret position the author's cursor lands on after the edit.
    /// A trailing retain does not move the caret; it only pads the walk.
    pub fn caret_index(&self) -> usize {
        let mut index: isize = 0;
        if let Some(Atom::Retain(n)) = self.atoms.last() {
            index = -(*n as isize);
        }
        for atom in &self.atoms {
            match atom {
                Atom::Retain(n) => index += *n as isize,
                Atom::Insert(s) => index += chars(s) as isize,
                Atom::Delete(_) => {}
            }
        }
        return index.max(0) as usize;
    }

    /// Apply the operation to a document, producing the new document.
    ///
    /// Characters past `base_len` are implicitly retained (the trimmed
    /// right edge). Fails if the operation consumes more characters than
    /// the document holds.
    pub fn apply(&self, doc: &str) -> Result<String, OtError> {
        let len = chars(doc);
        if self.base_len > len {
            return Err(OtError::IncompatibleOperation {
                expected: self.base_len,
                found: len,
            });
        }
        let mut out = String::with_capacity(doc.len() + self.inserted_len());
        let mut input = doc.chars();
        for atom in &self.atoms {
            match atom {
                Atom::Retain(n) => {
                    for _ in 0..*n {
                        match input.next() {
                            Some(c) => out.push(c),
                            None => unreachable!("retain past base_len"),
                        }
                    }
                }
                Atom::Insert(s) => out.push_str(s),
                Atom::Delete(n) => {
                    for _ in 0..*n {
                        input.next();
                    }
                }
            }
        }
        out.extend(input);
        return Ok(out);
    }

    /// Produce the operation that undoes this one when applied after it.
    /// Inserts become deletes, deletes become inserts of the text they
    /// removed (recovered from `doc`, the document before the edit).
    pub fn invert(&self, doc: &str) -> Result<Operation, OtError> {
        let len = chars(doc);
        if self.base_len > len {
            return Err(OtError::IncompatibleOperation {
                expected: self.base_len,
                found: len,
            });
        }
        let mut inverse = Operation::new();
        let mut input = doc.chars();
        for atom in &self.atoms {
            match atom {
                Atom::Retain(n) => {
                    inverse.retain(*n);
                    for _ in 0..*n {
                        input.next();
                    }
                }
                Atom::Insert(s) => inverse.delete(chars(s)),
                Atom::Delete(n) => {
                    let removed: String = input.by_ref().take(*n).collect();
                    inverse.insert(&removed);
                }
            }
        }
        inverse.trim();
        return Ok(inverse);
    }

    /// Build the single operation equivalent to applying `self` then
    /// `other`. The pair is padded so `self`'s output length matches
    /// `other`'s input length before walking.
    pub fn compose(&self, other: &Operation) -> Result<Operation, OtError> {
        let mut a = self.clone();
        let mut b = other.clone();
        if a.target_len < b.base_len {
            a.retain(b.base_len - a.target_len);
        } else {
            b.pad_to(a.target_len);
        }

        let mut result = Operation::new();
        let mut a_iter = a.atoms.into_iter();
        let mut b_iter = b.atoms.into_iter();
        let mut next_a = a_iter.next();
        let mut next_b = b_iter.next();
        loop {
            match (next_a.take(), next_b.take()) {
                (None, None) => break,
                // Deletes by the first operation happen before the second
                // operation ever sees the text.
                (Some(Atom::Delete(n)), b) => {
                    result.delete(n);
                    next_a = a_iter.next();
                    next_b = b;
                }
                // Inserts by the second operation land in the final text.
                (a, Some(Atom::Insert(s))) => {
                    result.insert(&s);
                    next_a = a;
                    next_b = b_iter.next();
                }
                (None, Some(_)) | (Some(_), None) => {
                    return Err(OtError::IncompatibleOperation {
                        expected: self.target_len,
                        found: other.base_len,
                    });
                }
                (Some(Atom::Retain(i)), Some(Atom::Retain(j))) => {
                    let n = i.min(j);
                    result.retain(n);
                    next_a = if i > n { Some(Atom::Retain(i - n)) } else { a_iter.next() };
                    next_b = if j > n { Some(Atom::Retain(j - n)) } else { b_iter.next() };
                }
                (Some(Atom::Retain(i)), Some(Atom::Delete(j))) => {
                    let n = i.min(j);
                    result.delete(n);
                    next_a = if i > n { Some(Atom::Retain(i - n)) } else { a_iter.next() };
                    next_b = if j > n { Some(Atom::Delete(j - n)) } else { b_iter.next() };
                }
                (Some(Atom::Insert(s)), Some(Atom::Retain(j))) => {
                    let len = chars(&s);
                    let n = len.min(j);
                    let (head, tail) = split_chars(&s, n);
                    result.insert(head);
                    next_a = if tail.is_empty() { a_iter.next() } else { Some(Atom::Insert(tail.to_owned())) };
                    next_b = if j > n { Some(Atom::Retain(j - n)) } else { b_iter.next() };
                }
                (Some(Atom::Insert(s)), Some(Atom::Delete(j))) => {
                    // The second operation deletes text the first inserted:
                    // the characters cancel out entirely.
                    let len = chars(&s);
                    let n = len.min(j);
                    let (_, tail) = split_chars(&s, n);
                    next_a = if tail.is_empty() { a_iter.next() } else { Some(Atom::Insert(tail.to_owned())) };
                    next_b = if j > n { Some(Atom::Delete(j - n)) } else { b_iter.next() };
                }
            }
        }
        result.trim();
        return Ok(result);
    }

    /// Transform two operations authored against the same base document
    /// into `(a_prime, b_prime)` such that applying `self` then `b_prime`
    /// equals applying `other` then `a_prime` (the convergence property).
    ///
    /// When both operations insert at the same position, `self`'s
    /// insertion is ordered first. The OT server passes the incoming
    /// operation as `self`, so the later-arriving edit lands before text
    /// committed concurrently at the same spot.
    pub fn transform(&self, other: &Operation) -> Result<(Operation, Operation), OtError> {
        let base = self.base_len.max(other.base_len);
        let mut a = self.clone();
        let mut b = other.clone();
        a.pad_to(base);
        b.pad_to(base);

        let mut a_prime = Operation::new();
        let mut b_prime = Operation::new();
        let mut a_iter = a.atoms.into_iter();
        let mut b_iter = b.atoms.into_iter();
        let mut next_a = a_iter.next();
        let mut next_b = b_iter.next();
        loop {
            match (next_a.take(), next_b.take()) {
                (None, None) => break,
                // Insert tie-break: self's insertion goes first.
                (Some(Atom::Insert(s)), b) => {
                    b_prime.retain(chars(&s));
                    a_prime.insert(&s);
                    next_a = a_iter.next();
                    next_b = b;
                }
                (a, Some(Atom::Insert(s))) => {
                    a_prime.retain(chars(&s));
                    b_prime.insert(&s);
                    next_a = a;
                    next_b = b_iter.next();
                }
                (None, Some(_)) | (Some(_), None) => {
                    return Err(OtError::IncompatibleOperation {
                        expected: self.base_len,
                        found: other.base_len,
                    });
                }
                (Some(Atom::Retain(i)), Some(Atom::Retain(j))) => {
                    let n = i.min(j);
                    a_prime.retain(n);
                    b_prime.retain(n);
                    next_a = if i > n { Some(Atom::Retain(i - n)) } else { a_iter.next() };
                    next_b = if j > n { Some(Atom::Retain(j - n)) } else { b_iter.next() };
                }
                // Both sides deleted the same range: it is already gone,
                // so neither transformed operation deletes it again.
                (Some(Atom::Delete(i)), Some(Atom::Delete(j))) => {
                    let n = i.min(j);
                    next_a = if i > n { Some(Atom::Delete(i - n)) } else { a_iter.next() };
                    next_b = if j > n { Some(Atom::Delete(j - n)) } else { b_iter.next() };
                }
                (Some(Atom::Delete(i)), Some(Atom::Retain(j))) => {
                    let n = i.min(j);
                    a_prime.delete(n);
                    next_a = if i > n { Some(Atom::Delete(i - n)) } else { a_iter.next() };
                    next_b = if j > n { Some(Atom::Retain(j - n)) } else { b_iter.next() };
                }
                (Some(Atom::Retain(i)), Some(Atom::Delete(j))) => {
                    let n = i.min(j);
                    b_prime.delete(n);
                    next_a = if i > n { Some(Atom::Retain(i - n)) } else { a_iter.next() };
                    next_b = if j > n { Some(Atom::Delete(j - n)) } else { b_iter.next() };
                }
            }
        }
        a_prime.trim();
        b_prime.trim();
        return Ok((a_prime, b_prime));
    }
}

// Wire form: a JSON array mixing positive integers (retain), strings
// (insert), and negative integers (delete).

impl serde::Serialize for Operation {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeSeq;
        let mut seq = serializer.serialize_seq(Some(self.atoms.len()))?;
        for atom in &self.atoms {
            match atom {
                Atom::Retain(n) => seq.serialize_element(&(*n as i64))?,
                Atom::Insert(s) => seq.serialize_element(s)?,
                Atom::Delete(n) => seq.serialize_element(&-(*n as i64))?,
            }
        }
        return seq.end();
    }
}

/// Largest retain/delete count accepted off the wire. No real document
/// outgrows a single frame, and unbounded counts would let a hostile
/// frame overflow the cached lengths.
const MAX_WIRE_COUNT: u64 = 1 << 20;

#[derive(serde::Deserialize)]
#[serde(untagged)]
enum WireAtom {
    Count(i64),
    Text(String),
}

impl<'de> serde::Deserialize<'de> for Operation {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Operation, D::Error> {
        use serde::de::Error;
        let raw = Vec::<WireAtom>::deserialize(deserializer)?;
        let mut op = Operation::new();
        for atom in raw {
            match atom {
                WireAtom::Count(n) => {
                    let count = n.unsigned_abs();
                    if count > MAX_WIRE_COUNT {
                        return Err(D::Error::custom(format!(
                            "operation count {n} exceeds the {MAX_WIRE_COUNT} limit"
                        )));
                    }
                    if n > 0 {
                        op.retain(count as usize);
                    } else {
                        op.delete(count as usize);
                    }
                }
                WireAtom::Text(s) => op.insert(&s),
            }
        }
        op.trim();
        return Ok(op);
    }
}
