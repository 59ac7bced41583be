//! Bounded undo/redo stacks of inverse operations.
//!
//! Each local edit pushes its inverse onto the undo stack; undoing pushes
//! the inverse of the inverse onto redo. Remote edits rewrite both stacks
//! through [`Operation::transform`] so an old inverse still lands where
//! the user expects after concurrent edits have shifted the text.

use super::{Operation, OtError};

/// Default depth kept on each stack.
pub const DEFAULT_UNDO_LIMIT: usize = 50;

/// Undo/redo history for one buffer.
#[derive(Clone, Debug)]
pub struct UndoStack {
    limit: usize,
    undo: Vec<Operation>,
    redo: Vec<Operation>,
}

impl Default for UndoStack {
    fn default() -> UndoStack {
        return UndoStack::new(DEFAULT_UNDO_LIMIT);
    }
}

impl UndoStack {
    /// Create empty stacks bounded to `limit` entries each.
    pub fn new(limit: usize) -> UndoStack {
        return UndoStack {
            limit,
            undo: Vec::new(),
            redo: Vec::new(),
        };
    }

    /// Record a fresh local edit. `doc_before` is the document the edit
    /// was applied to. A fresh edit invalidates the redo branch.
    pub fn record(&mut self, op: &Operation, doc_before: &str) -> Result<(), OtError> {
        let inverse = op.invert(doc_before)?;
        self.push_undo(inverse);
        self.redo.clear();
        return Ok(());
    }

    /// Record the application of an undo operation: its inverse becomes
    /// redoable. Does not clear the redo stack.
    pub fn record_undo(&mut self, op: &Operation, doc_before: &str) -> Result<(), OtError> {
        let inverse = op.invert(doc_before)?;
        if self.redo.len() == self.limit {
            self.redo.remove(0);
        }
        self.redo.push(inverse);
        return Ok(());
    }

    /// Record the application of a redo operation: its inverse becomes
    /// undoable again. Does not clear the redo stack.
    pub fn record_redo(&mut self, op: &Operation, doc_before: &str) -> Result<(), OtError> {
        let inverse = op.invert(doc_before)?;
        self.push_undo(inverse);
        return Ok(());
    }

    /// Pop the next operation to apply as an undo.
    pub fn pop_undo(&mut self) -> Option<Operation> {
        return self.undo.pop();
    }

    /// Pop the next operation to apply as a redo.
    pub fn pop_redo(&mut self) -> Option<Operation> {
        return self.redo.pop();
    }

    /// Rewrite both stacks through a remote operation so stored inverses
    /// stay aligned with the shifted text. Empty inverses are dropped.
    pub fn transform_remote(&mut self, remote: &Operation) -> Result<(), OtError> {
        for stack in [&mut self.undo, &mut self.redo] {
            let mut rewritten = Vec::with_capacity(stack.len());
            for op in stack.drain(..) {
                let (op, _) = op.transform(remote)?;
                if !op.is_noop() {
                    rewritten.push(op);
                }
            }
            *stack = rewritten;
        }
        return Ok(());
    }

    /// Number of undoable operations.
    pub fn undo_depth(&self) -> usize {
        return self.undo.len();
    }

    /// Number of redoable operations.
    pub fn redo_depth(&self) -> usize {
        return self.redo.len();
    }

    fn push_undo(&mut self, op: Operation) {
        if self.undo.len() == self.limit {
            self.undo.remove(0);
        }
        self.undo.push(op);
    }
}
