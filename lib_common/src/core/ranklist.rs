//! # Ranked List
//!
//! The ordered collection of participant items. Position 0 is the head.
//!
//! Items only move through single-step promotion: an item swaps with its
//! immediate predecessor unless that predecessor is locked, in which case the
//! step does nothing. Locked items never move by promotion themselves, so a
//! lock acts as a barrier that nothing below it can pass.
//!
//! The list lives inside a [`Document`], so every mutation here marks it dirty
//! for the next debounced save.

use serde::{Deserialize, Serialize};

use super::persistence::{Document, StoreError};

/// Per-connection unique token addressing an item.
pub type SessionId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListItem {
    /// Session id of the owning connection.
    pub id: SessionId,
    pub text: String,
    #[serde(default)]
    pub votes: u32,
    #[serde(default)]
    pub promotions: u32,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub admin: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl ListItem {
    pub fn new(id: SessionId, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
            votes: 0,
            promotions: 0,
            locked: false,
            admin: false,
            color: None,
        }
    }

    /// Lifecycle state with respect to voting. Removal is represented by absence.
    pub fn state(&self, vote_threshold: u32) -> ItemState {
        if self.locked {
            ItemState::Locked
        } else if self.promotions > 0 {
            ItemState::Promoted
        } else if self.votes >= vote_threshold {
            ItemState::Promotable
        } else {
            ItemState::Pending
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Pending,
    Promotable,
    Promoted,
    Locked,
}

/// Result of one promotion step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The item at `from` swapped with `from - 1`.
    Moved { from: usize },
    /// Already at the head.
    AtHead,
    /// The predecessor (or the item itself) is locked.
    Blocked,
}

pub struct RankedList {
    doc: Document<ListItem>,
}

impl RankedList {
    pub fn new(doc: Document<ListItem>) -> Self {
        Self { doc }
    }

    pub fn items(&self) -> &[ListItem] {
        self.doc.items()
    }

    pub fn len(&self) -> usize {
        self.doc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc.is_empty()
    }

    pub fn position(&self, id: SessionId) -> Option<usize> {
        self.doc.items().iter().position(|item| item.id == id)
    }

    pub fn get(&self, id: SessionId) -> Option<&ListItem> {
        self.doc.items().iter().find(|item| item.id == id)
    }

    /// Mutable access to one item; marks the list dirty when found.
    pub fn get_mut(&mut self, id: SessionId) -> Option<(usize, &mut ListItem)> {
        let index = self.position(id)?;
        Some((index, &mut self.doc.items_mut()[index]))
    }

    /// Largest session id present, used to keep new ids unique after a reload.
    pub fn max_id(&self) -> Option<SessionId> {
        self.doc.items().iter().map(|item| item.id).max()
    }

    /// Appends at the tail and returns the new index.
    pub fn push(&mut self, item: ListItem) -> usize {
        self.doc.push(item);
        self.doc.len() - 1
    }

    /// Removes the item owned by `id`, returning its index prior to removal.
    pub fn remove(&mut self, id: SessionId) -> Option<(usize, ListItem)> {
        let index = self.position(id)?;
        let item = self.doc.items_mut().remove(index);
        Some((index, item))
    }

    /// One promotion step for the item at `index`.
    pub fn promote(&mut self, index: usize) -> Step {
        let items = self.doc.items();
        if index >= items.len() || items[index].locked {
            return Step::Blocked;
        }
        if index == 0 {
            return Step::AtHead;
        }
        if items[index - 1].locked {
            return Step::Blocked;
        }

        let items = self.doc.items_mut();
        items.swap(index, index - 1);
        items[index - 1].promotions += 1;
        Step::Moved { from: index }
    }

    /// Repeats [`RankedList::promote`] until the head or a lock stops it.
    ///
    /// Returns the `from` index of every successful swap, in order.
    pub fn force_to_top(&mut self, mut index: usize) -> Vec<usize> {
        let mut moves = Vec::new();
        while let Step::Moved { from } = self.promote(index) {
            moves.push(from);
            index = from - 1;
        }
        moves
    }

    /// Number of swaps [`RankedList::force_to_top`] would perform from `index`.
    pub fn distance_to_barrier(&self, index: usize) -> usize {
        let items = self.doc.items();
        if index >= items.len() || items[index].locked {
            return 0;
        }
        match items[..index].iter().rposition(|item| item.locked) {
            Some(lock) => index - lock - 1,
            None => index,
        }
    }

    pub fn is_full(&self, max_items: usize) -> bool {
        self.doc.len() >= max_items
    }

    pub fn maybe_save(&mut self) -> Result<bool, StoreError> {
        self.doc.maybe_save()
    }

    pub fn force_save(&mut self) -> Result<(), StoreError> {
        self.doc.force_save()
    }

    pub fn rollover(&mut self, pattern: &str) -> Result<std::path::PathBuf, StoreError> {
        self.doc.rollover(pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::persistence::{BlobStore, MemoryStore};
    use std::sync::Arc;

    fn list_of(n: u64) -> RankedList {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryStore::new());
        let mut list = RankedList::new(Document::load(store, "story.json"));
        for id in 0..n {
            list.push(ListItem::new(id, format!("w{id}")));
        }
        list
    }

    fn ids(list: &RankedList) -> Vec<SessionId> {
        list.items().iter().map(|i| i.id).collect()
    }

    #[test]
    fn promote_swaps_with_predecessor() {
        let mut list = list_of(4);
        assert_eq!(list.promote(2), Step::Moved { from: 2 });
        assert_eq!(ids(&list), vec![0, 2, 1, 3]);
        assert_eq!(list.get(2).unwrap().promotions, 1);
        assert_eq!(list.get(2).unwrap().state(3), ItemState::Promoted);
    }

    #[test]
    fn promote_at_head_and_below_lock() {
        let mut list = list_of(3);
        assert_eq!(list.promote(0), Step::AtHead);

        list.get_mut(0).unwrap().1.locked = true;
        assert_eq!(list.promote(1), Step::Blocked);
        assert_eq!(ids(&list), vec![0, 1, 2]);
    }

    #[test]
    fn locked_item_does_not_move() {
        let mut list = list_of(3);
        list.get_mut(2).unwrap().1.locked = true;
        assert_eq!(list.promote(2), Step::Blocked);
        assert_eq!(list.get(2).unwrap().state(3), ItemState::Locked);
    }

    #[test]
    fn force_to_top_reaches_head() {
        let mut list = list_of(6);
        assert_eq!(list.distance_to_barrier(5), 5);
        let moves = list.force_to_top(5);
        assert_eq!(moves, vec![5, 4, 3, 2, 1]);
        assert_eq!(list.position(5), Some(0));
    }

    #[test]
    fn force_to_top_stops_under_lock() {
        let mut list = list_of(8);
        list.get_mut(2).unwrap().1.locked = true;
        let expected = list.distance_to_barrier(6);
        assert_eq!(expected, 3);

        let moves = list.force_to_top(6);
        assert_eq!(moves.len(), expected);
        assert_eq!(list.position(6), Some(3));
        assert_eq!(list.position(2), Some(2));
    }

    #[test]
    fn remove_reports_prior_index() {
        let mut list = list_of(4);
        let (index, item) = list.remove(2).unwrap();
        assert_eq!(index, 2);
        assert_eq!(item.id, 2);
        assert_eq!(ids(&list), vec![0, 1, 3]);
        assert!(list.remove(2).is_none());
    }

    #[test]
    fn states_follow_votes() {
        let mut item = ListItem::new(1, "a");
        assert_eq!(item.state(3), ItemState::Pending);
        item.votes = 3;
        assert_eq!(item.state(3), ItemState::Promotable);
    }
}
