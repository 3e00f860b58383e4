//! Nested transaction bookkeeping.
//!
//! Only the outermost begin/commit/rollback reaches the engine. A rollback
//! of an inner unit marks the whole transaction dirty, which turns the
//! outermost commit into a rollback. No savepoints are used.

use crate::error::{DbError, DbResult};

/// What the connection must send to the engine after a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionAction {
    /// Nothing; an inner unit was opened or closed
    None,
    Begin,
    Commit,
    Rollback,
    /// Roll back, then report [`DbError::Commit`] to the caller
    RollbackDirty,
}

/// Depth counter plus dirty flag. `dirty` implies `depth > 0`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionState {
    depth: u32,
    dirty: bool,
}

impl TransactionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_active(&self) -> bool {
        self.depth > 0
    }

    pub fn begin(&mut self) -> TransactionAction {
        self.depth += 1;
        if self.depth == 1 {
            TransactionAction::Begin
        } else {
            TransactionAction::None
        }
    }

    pub fn commit(&mut self) -> DbResult<TransactionAction> {
        if self.depth == 0 {
            return Err(DbError::transaction("commit without an open transaction"));
        }
        self.depth -= 1;
        if self.depth > 0 {
            return Ok(TransactionAction::None);
        }
        if std::mem::take(&mut self.dirty) {
            Ok(TransactionAction::RollbackDirty)
        } else {
            Ok(TransactionAction::Commit)
        }
    }

    pub fn rollback(&mut self) -> DbResult<TransactionAction> {
        if self.depth == 0 {
            return Err(DbError::transaction("rollback without an open transaction"));
        }
        self.depth -= 1;
        if self.depth > 0 {
            self.dirty = true;
            return Ok(TransactionAction::None);
        }
        self.dirty = false;
        Ok(TransactionAction::Rollback)
    }

    /// Forget all open units, e.g. after the vendor session was lost.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
