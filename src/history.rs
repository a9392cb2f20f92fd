//! Undo/redo history over element snapshots.
//!
//! Each local mutation pushes a copy of the element collections taken before
//! the change. Undo swaps the current collections for the most recent entry
//! and moves the current ones onto the redo stack. Any new local mutation
//! clears the redo stack. Remote-origin changes never enter history.

use std::collections::VecDeque;

use crate::doc::Elements;

pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Bounded snapshot history.
#[derive(Debug, Clone)]
pub struct History {
    undo_stack: VecDeque<Elements>,
    redo_stack: Vec<Elements>,
    limit: usize,
}

impl History {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self { undo_stack: VecDeque::new(), redo_stack: Vec::new(), limit: limit.max(1) }
    }

    /// Save the state from before a local mutation.
    pub fn record(&mut self, before: Elements) {
        self.undo_stack.push_back(before);
        self.redo_stack.clear();
        while self.undo_stack.len() > self.limit {
            self.undo_stack.pop_front();
        }
    }

    /// Step back. Returns the state to restore, keeping `current` for redo.
    pub fn undo(&mut self, current: &Elements) -> Option<Elements> {
        let previous = self.undo_stack.pop_back()?;
        self.redo_stack.push(current.clone());
        Some(previous)
    }

    /// Step forward. Returns the state to restore, keeping `current` for undo.
    pub fn redo(&mut self, current: &Elements) -> Option<Elements> {
        let next = self.redo_stack.pop()?;
        self.undo_stack.push_back(current.clone());
        Some(next)
    }

    #[must_use]
    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    #[must_use]
    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }

    #[must_use]
    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    #[must_use]
    pub fn redo_count(&self) -> usize {
        self.redo_stack.len()
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::{Card, Point};

    fn with_card(id: &str) -> Elements {
        let mut elements = Elements::default();
        elements.cards.insert(id.into(), Card::new(id, Point::default(), id));
        elements
    }

    #[test]
    fn undo_then_redo_restores() {
        let mut history = History::new(10);
        let before = Elements::default();
        let after = with_card("a");
        history.record(before.clone());

        let restored = history.undo(&after).unwrap();
        assert_eq!(restored, before);
        assert!(history.can_redo());

        let redone = history.redo(&restored).unwrap();
        assert_eq!(redone, after);
        assert!(history.can_undo());
    }

    #[test]
    fn record_clears_redo() {
        let mut history = History::new(10);
        history.record(Elements::default());
        let _ = history.undo(&with_card("a"));
        assert!(history.can_redo());
        history.record(with_card("b"));
        assert!(!history.can_redo());
    }

    #[test]
    fn limit_drops_oldest() {
        let mut history = History::new(2);
        history.record(with_card("a"));
        history.record(with_card("b"));
        history.record(with_card("c"));
        assert_eq!(history.undo_count(), 2);
        let top = history.undo(&Elements::default()).unwrap();
        assert!(top.cards.contains_key("c"));
        let next = history.undo(&top).unwrap();
        assert!(next.cards.contains_key("b"));
        assert!(history.undo(&next).is_none());
    }

    #[test]
    fn empty_history_undo_redo_none() {
        let mut history = History::default();
        assert!(history.undo(&Elements::default()).is_none());
        assert!(history.redo(&Elements::default()).is_none());
        assert!(!history.can_undo());
        assert!(!history.can_redo());
    }

    #[test]
    fn clear_empties_both_stacks() {
        let mut history = History::default();
        history.record(Elements::default());
        let _ = history.undo(&with_card("a"));
        history.record(Elements::default());
        history.clear();
        assert_eq!(history.undo_count(), 0);
        assert_eq!(history.redo_count(), 0);
    }
}
