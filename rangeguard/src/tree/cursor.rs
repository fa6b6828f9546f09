//! Step-wise traversal over an [`RbMap`].
//!
//! A cursor remembers the path from the root to its current node, so each
//! step costs amortized constant time without parent pointers.

use super::{HEIGHT_LIMIT, Header, LEFT, Link, Node, RIGHT, RbMap, child, opposite};
use smallvec::SmallVec;
use std::marker::PhantomData;
use std::ptr::NonNull;

/// A position inside a map, able to move one entry at a time in either
/// direction.
///
/// The cursor borrows the map, so the tree cannot be modified while the
/// cursor is alive.
pub struct Cursor<'a, K, V> {
    path: SmallVec<[NonNull<Header>; HEIGHT_LIMIT]>,
    current: Link,
    marker: PhantomData<&'a RbMap<K, V>>,
}

impl<'a, K, V> Cursor<'a, K, V> {
    /// Positions a cursor at the extreme entry in direction `dir`.
    pub(super) fn start(map: &'a RbMap<K, V>, dir: usize) -> Self {
        let mut cursor = Self {
            path: SmallVec::new(),
            current: None,
            marker: PhantomData,
        };
        if let Some(mut node) = map.root {
            // SAFETY: nodes reachable from the root live as long as the borrow.
            while let Some(next) = unsafe { child(node, dir) } {
                cursor.path.push(node);
                node = next;
            }
            cursor.current = Some(node);
        }
        cursor
    }

    /// Entry under the cursor, or `None` once it walked off either end.
    pub fn current(&self) -> Option<(&'a K, &'a V)> {
        let node = self.current?;
        // SAFETY: the node belongs to the borrowed map.
        unsafe { Some((Node::<K, V>::key(node), Node::<K, V>::value(node))) }
    }

    /// Advances to the next larger key.
    pub fn move_next(&mut self) -> Option<(&'a K, &'a V)> {
        self.step(RIGHT);
        self.current()
    }

    /// Moves back to the next smaller key.
    pub fn move_prev(&mut self) -> Option<(&'a K, &'a V)> {
        self.step(LEFT);
        self.current()
    }

    fn step(&mut self, dir: usize) {
        let Some(mut node) = self.current else {
            return;
        };
        // SAFETY: every node on the path belongs to the borrowed map.
        unsafe {
            if let Some(next) = child(node, dir) {
                // Extreme node of the subtree on the `dir` side.
                self.path.push(node);
                node = next;
                while let Some(next) = child(node, opposite(dir)) {
                    self.path.push(node);
                    node = next;
                }
                self.current = Some(node);
                return;
            }

            // Climb until we arrive from the side opposite to `dir`.
            loop {
                let Some(parent) = self.path.pop() else {
                    self.current = None;
                    return;
                };
                let came_from = node;
                node = parent;
                if child(parent, dir) != Some(came_from) {
                    self.current = Some(parent);
                    return;
                }
            }
        }
    }
}

/// Double-ended iterator over a map's entries in key order.
pub struct Iter<'a, K, V> {
    front: Cursor<'a, K, V>,
    back: Cursor<'a, K, V>,
    remaining: usize,
}

impl<'a, K, V> Iter<'a, K, V> {
    pub(super) fn new(map: &'a RbMap<K, V>) -> Self {
        Self {
            front: Cursor::start(map, LEFT),
            back: Cursor::start(map, RIGHT),
            remaining: map.len(),
        }
    }
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let item = self.front.current()?;
        self.front.step(RIGHT);
        self.remaining -= 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K, V> DoubleEndedIterator for Iter<'_, K, V> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let item = self.back.current()?;
        self.back.step(LEFT);
        self.remaining -= 1;
        Some(item)
    }
}

impl<K, V> ExactSizeIterator for Iter<'_, K, V> {}
