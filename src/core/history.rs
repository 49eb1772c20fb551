use serde::{Deserialize, Serialize};

use crate::types::OpId;

/// Availability flags exposed to toolbars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UndoRedoState {
    /// An undoable entry exists.
    pub can_undo: bool,
    /// The most recent undo has not been invalidated by a new edit.
    pub can_redo: bool,
}

/// Linear undo/redo over log entry ids.
///
/// `undo` holds entries whose effect is live and may be neutralized; `redo`
/// holds entries neutralized by undo. Neither stack owns payloads: the log
/// does, and it is never shortened.
#[derive(Debug, Default)]
pub struct UndoRedoStack {
    undo: Vec<OpId>,
    redo: Vec<OpId>,
    max_depth: Option<usize>,
}

impl UndoRedoStack {
    /// Unbounded stacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stacks whose undo side keeps at most `max_depth` ids.
    pub fn with_max_depth(max_depth: usize) -> Self {
        Self {
            max_depth: Some(max_depth),
            ..Self::default()
        }
    }

    /// A fresh user edit: undoable, and invalidates redo.
    pub fn record_edit(&mut self, id: OpId) {
        self.redo.clear();
        self.push_undo(id);
    }

    /// A redo re-applied `id` as a new entry; that entry becomes undoable.
    pub fn record_redo(&mut self, id: OpId) {
        self.push_undo(id);
    }

    /// Next entry `undo` would neutralize.
    pub fn peek_undo(&self) -> Option<OpId> {
        self.undo.last().copied()
    }

    /// Next entry `redo` would re-apply.
    pub fn peek_redo(&self) -> Option<OpId> {
        self.redo.last().copied()
    }

    /// Moves the top undoable entry to the redo side.
    pub fn commit_undo(&mut self) -> Option<OpId> {
        let id = self.undo.pop()?;
        self.redo.push(id);
        Some(id)
    }

    /// Pops the entry a redo is about to re-apply.
    pub fn take_redo(&mut self) -> Option<OpId> {
        self.redo.pop()
    }

    /// Drops `id` wherever it sits; used when an entry is rejected.
    pub fn forget(&mut self, id: OpId) {
        self.undo.retain(|x| *x != id);
        self.redo.retain(|x| *x != id);
    }

    /// A rejected undo means `target` is live again.
    pub fn reinstate_undo(&mut self, target: OpId) {
        if let Some(at) = self.redo.iter().rposition(|x| *x == target) {
            self.redo.remove(at);
            self.push_undo(target);
        }
    }

    /// A rejected redo means `target` is neutralized again.
    pub fn reinstate_redo(&mut self, redo_entry: OpId, target: OpId) {
        let before = self.undo.len();
        self.undo.retain(|x| *x != redo_entry);
        if self.undo.len() != before {
            self.redo.push(target);
        }
    }

    /// Undo/redo availability.
    pub fn state(&self) -> UndoRedoState {
        UndoRedoState {
            can_undo: !self.undo.is_empty(),
            can_redo: !self.redo.is_empty(),
        }
    }

    /// Entries on the undo side.
    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    /// Drops both stacks.
    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }

    fn push_undo(&mut self, id: OpId) {
        self.undo.push(id);
        if let Some(max) = self.max_depth
            && self.undo.len() > max
        {
            self.undo.remove(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_edit_invalidates_redo() {
        let mut history = UndoRedoStack::new();
        let a = OpId::new();
        history.record_edit(a);
        assert_eq!(history.commit_undo(), Some(a));
        assert_eq!(
            history.state(),
            UndoRedoState {
                can_undo: false,
                can_redo: true
            }
        );

        history.record_edit(OpId::new());
        assert!(!history.state().can_redo);
        assert_eq!(history.take_redo(), None);
    }

    #[test]
    fn redo_keeps_remaining_redo_entries() {
        let mut history = UndoRedoStack::new();
        let a = OpId::new();
        let b = OpId::new();
        history.record_edit(a);
        history.record_edit(b);
        history.commit_undo();
        history.commit_undo();

        assert_eq!(history.take_redo(), Some(a));
        let a_again = OpId::new();
        history.record_redo(a_again);
        assert_eq!(history.peek_redo(), Some(b));
        assert_eq!(history.peek_undo(), Some(a_again));
    }

    #[test]
    fn rejected_entries_are_reconciled() {
        let mut history = UndoRedoStack::new();
        let a = OpId::new();
        history.record_edit(a);
        history.commit_undo();
        history.reinstate_undo(a);
        assert_eq!(history.peek_undo(), Some(a));
        assert!(!history.state().can_redo);

        let redo_entry = OpId::new();
        history.commit_undo();
        history.take_redo();
        history.record_redo(redo_entry);
        history.reinstate_redo(redo_entry, a);
        assert_eq!(history.peek_redo(), Some(a));
        assert!(!history.state().can_undo);

        history.forget(a);
        assert_eq!(history.state(), UndoRedoState::default());
    }

    #[test]
    fn depth_limit_drops_oldest() {
        let mut history = UndoRedoStack::with_max_depth(2);
        let ids: Vec<OpId> = (0..3).map(|_| OpId::new()).collect();
        for id in &ids {
            history.record_edit(*id);
        }
        assert_eq!(history.undo_len(), 2);
        assert_eq!(history.commit_undo(), Some(ids[2]));
        assert_eq!(history.commit_undo(), Some(ids[1]));
        assert_eq!(history.commit_undo(), None);
    }
}
