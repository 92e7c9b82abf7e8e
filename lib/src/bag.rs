// Copyright 2025 The Chert Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A bag of positive integers.
//!
//! The graph walkers mark visited rids in a bag, and the verifier and leaf
//! maintenance collect pending rids in one. Elements must be positive; zero
//! is reserved as "no element" by the callers.

use std::collections::HashSet;

use crate::repo::Rid;

/// An unordered collection of positive integers without duplicates.
#[derive(Debug, Default, Clone)]
pub struct Bag {
    elems: HashSet<Rid>,
}

impl Bag {
    /// Creates an empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `e` if not present. Returns true if the insert occurred.
    pub fn insert(&mut self, e: Rid) -> bool {
        debug_assert!(e > 0);
        self.elems.insert(e)
    }

    /// Returns true if `e` is in the bag.
    pub fn contains(&self, e: Rid) -> bool {
        debug_assert!(e > 0);
        self.elems.contains(&e)
    }

    /// Removes `e` if present.
    pub fn remove(&mut self, e: Rid) {
        self.elems.remove(&e);
    }

    /// Number of elements in the bag.
    pub fn len(&self) -> usize {
        self.elems.len()
    }

    /// Returns true if the bag holds no elements.
    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    /// Removes and returns an arbitrary element.
    pub fn pop(&mut self) -> Option<Rid> {
        let e = self.elems.iter().next().copied()?;
        self.elems.remove(&e);
        Some(e)
    }

    /// Drains the bag in ascending order. Deterministic iteration keeps the
    /// derived tables reproducible no matter what order rids were queued in.
    pub fn drain_sorted(&mut self) -> Vec<Rid> {
        let mut elems: Vec<Rid> = self.elems.drain().collect();
        elems.sort_unstable();
        elems
    }

    /// Removes all elements.
    pub fn clear(&mut self) {
        self.elems.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_find_remove() {
        let mut bag = Bag::new();
        assert!(bag.insert(5));
        assert!(!bag.insert(5));
        assert!(bag.contains(5));
        assert!(!bag.contains(6));
        bag.remove(5);
        assert!(!bag.contains(5));
        assert!(bag.is_empty());
    }

    #[test]
    fn test_drain_sorted() {
        let mut bag = Bag::new();
        for e in [9, 2, 7, 2, 1] {
            bag.insert(e);
        }
        assert_eq!(bag.drain_sorted(), vec![1, 2, 7, 9]);
        assert!(bag.is_empty());
    }
}
