use std::hash::Hash;
use indexmap::IndexSet;
use serde::Serialize;

/// Recency order used by the page table and the TLB
///
/// The front is the least recently used element, the back the most recently used. Touching an
/// element moves it to the back. Backed by an `IndexSet` so membership checks are O(1); removal
/// shifts the tail, which is fine for the few hundred entries these orders hold
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct LruQueue<T: Hash + Eq> {
    order: IndexSet<T>,
}

impl<T: Hash + Eq + Copy> LruQueue<T> {
    pub fn new() -> Self {
        Self { order: IndexSet::new() }
    }

    /// Appends `item` as most recently used. Returns false if it was already queued
    pub fn push(&mut self, item: T) -> bool {
        self.order.insert(item)
    }

    /// Moves `item` to the most recently used end. Returns false if it isn't queued
    pub fn touch(&mut self, item: T) -> bool {
        match self.order.get_index_of(&item) {
            Some(index) => {
                let last = self.order.len() - 1;
                self.order.move_index(index, last);
                true
            }
            None => false,
        }
    }

    /// Removes `item`, keeping the relative order of everything else
    pub fn remove(&mut self, item: T) -> bool {
        self.order.shift_remove(&item)
    }

    /// The least recently used element
    pub fn front(&self) -> Option<T> {
        self.order.first().copied()
    }

    pub fn contains(&self, item: T) -> bool {
        self.order.contains(&item)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Iterates from least to most recently used
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        self.order.iter().copied()
    }
}

impl<T: Hash + Eq + Copy> Default for LruQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
