//! Ordered map backed by a top-down red-black tree.
//!
//! Both insertion and removal rebalance on the way down: a single pass from
//! the root performs every color flip and rotation, so neither operation needs
//! parent pointers or a second upward walk.
//!
//! Nodes are boxed and owned by exactly one parent link (or the root slot).
//! Links are stored as [`NonNull`] so the rebalancing loops can keep a window
//! of four ancestors alive at once; no pointer ever escapes this module except
//! through [`Cursor`], which borrows the map.

mod cursor;

pub use cursor::{Cursor, Iter};

use std::cmp::Ordering;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

const LEFT: usize = 0;
const RIGHT: usize = 1;

/// Tallest tree a cursor can walk without spilling its path to the heap.
const HEIGHT_LIMIT: usize = 64;

type Link = Option<NonNull<Header>>;

/// Color and child links.
///
/// Real nodes start with a header, and the rebalancing loops use a bare header
/// on the stack as a false root so the real root needs no special casing.
#[repr(C)]
struct Header {
    red: bool,
    link: [Link; 2],
}

#[repr(C)]
struct Node<K, V> {
    header: Header,
    key: K,
    value: V,
}

impl<K, V> Node<K, V> {
    /// Boxes a new red leaf and hands back its header.
    fn alloc(key: K, value: V) -> NonNull<Header> {
        let node = Box::new(Node {
            header: Header {
                red: true,
                link: [None, None],
            },
            key,
            value,
        });
        NonNull::from(Box::leak(node)).cast()
    }

    /// Reclaims a node created by [`Node::alloc`].
    ///
    /// # Safety
    ///
    /// `header` must come from `alloc` with the same `K` and `V`, must be
    /// unlinked from the tree, and must not be used afterwards.
    unsafe fn free(header: NonNull<Header>) -> (K, V) {
        // SAFETY: guaranteed by the caller.
        let node = unsafe { Box::from_raw(header.cast::<Self>().as_ptr()) };
        let Node { key, value, .. } = *node;
        (key, value)
    }

    /// # Safety
    ///
    /// `header` must belong to a live `Node<K, V>` that outlives `'a`.
    unsafe fn key<'a>(header: NonNull<Header>) -> &'a K {
        unsafe { &(*header.cast::<Self>().as_ptr()).key }
    }

    /// # Safety
    ///
    /// Same as [`Node::key`].
    unsafe fn value<'a>(header: NonNull<Header>) -> &'a V {
        unsafe { &(*header.cast::<Self>().as_ptr()).value }
    }

    /// # Safety
    ///
    /// Same as [`Node::key`], and no other reference to the value may exist.
    unsafe fn value_mut<'a>(header: NonNull<Header>) -> &'a mut V {
        unsafe { &mut (*header.cast::<Self>().as_ptr()).value }
    }
}

fn opposite(dir: usize) -> usize {
    1 - dir
}

/// # Safety
///
/// `node` must be empty or point to a live header.
unsafe fn is_red(node: Link) -> bool {
    match node {
        Some(node) => unsafe { (*node.as_ptr()).red },
        None => false,
    }
}

/// # Safety
///
/// `node` must point to a live header.
unsafe fn child(node: NonNull<Header>, dir: usize) -> Link {
    unsafe { (*node.as_ptr()).link[dir] }
}

/// # Safety
///
/// `node` must point to a live header.
unsafe fn set_child(node: NonNull<Header>, dir: usize, link: Link) {
    unsafe { (*node.as_ptr()).link[dir] = link }
}

/// # Safety
///
/// `node` must point to a live header.
unsafe fn set_red(node: NonNull<Header>, red: bool) {
    unsafe { (*node.as_ptr()).red = red }
}

/// Recolors `node` if there is one.
///
/// # Safety
///
/// `node` must be empty or point to a live header.
unsafe fn paint(node: Link, red: bool) {
    if let Some(node) = node {
        unsafe { set_red(node, red) }
    }
}

/// Rotates the subtree at `root` towards `dir` and returns the new subtree
/// root. The old root turns red and the new one black.
///
/// # Safety
///
/// `root` must be a live node whose child opposite to `dir` exists.
unsafe fn rotate_single(root: NonNull<Header>, dir: usize) -> NonNull<Header> {
    unsafe {
        let save = child(root, opposite(dir)).expect("rotation needs a child to lift");
        set_child(root, opposite(dir), child(save, dir));
        set_child(save, dir, Some(root));
        set_red(root, true);
        set_red(save, false);
        save
    }
}

/// Rotates the child opposite to `dir` the other way, then `root` towards
/// `dir`. Straightens a red chain that changes direction.
///
/// # Safety
///
/// `root` must be a live node whose child opposite to `dir` has a child on
/// the `dir` side.
unsafe fn rotate_double(root: NonNull<Header>, dir: usize) -> NonNull<Header> {
    unsafe {
        let lower = child(root, opposite(dir)).expect("rotation needs a child to lift");
        set_child(root, opposite(dir), Some(rotate_single(lower, opposite(dir))));
        rotate_single(root, dir)
    }
}

/// An ordered map from `K` to `V` with logarithmic insert, lookup and removal.
///
/// Keys are unique: inserting a key that is already present is rejected and
/// leaves the map untouched.
pub struct RbMap<K, V> {
    root: Link,
    len: usize,
    marker: PhantomData<Box<Node<K, V>>>,
}

// SAFETY: the map exclusively owns its nodes, exactly like a `Box` tree would.
unsafe impl<K: Send, V: Send> Send for RbMap<K, V> {}
// SAFETY: shared access only hands out shared references to keys and values.
unsafe impl<K: Sync, V: Sync> Sync for RbMap<K, V> {}

impl<K, V> RbMap<K, V> {
    /// Creates an empty map.
    pub const fn new() -> Self {
        Self {
            root: None,
            len: 0,
            marker: PhantomData,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of nodes on the longest path from the root to a leaf.
    pub fn height(&self) -> usize {
        let mut deepest = 0;
        let mut pending: Vec<(NonNull<Header>, usize)> =
            self.root.map(|root| (root, 1)).into_iter().collect();
        while let Some((node, depth)) = pending.pop() {
            deepest = deepest.max(depth);
            for dir in [LEFT, RIGHT] {
                // SAFETY: every reachable link points at a node owned by this map.
                if let Some(next) = unsafe { child(node, dir) } {
                    pending.push((next, depth + 1));
                }
            }
        }
        deepest
    }

    /// Drops every entry.
    ///
    /// Left links are rotated away until the tree is a right-leaning list,
    /// which is then freed front to back without recursion.
    pub fn clear(&mut self) {
        let mut curr = self.root.take();
        while let Some(node) = curr {
            // SAFETY: `node` is owned by this map and detached from `root`;
            // each node is freed exactly once, after it has no left child.
            unsafe {
                match child(node, LEFT) {
                    None => {
                        curr = child(node, RIGHT);
                        drop(Node::<K, V>::free(node));
                    }
                    Some(left) => {
                        set_child(node, LEFT, child(left, RIGHT));
                        set_child(left, RIGHT, Some(node));
                        curr = Some(left);
                    }
                }
            }
        }
        self.len = 0;
    }

    /// Cursor positioned at the smallest key.
    pub fn cursor_first(&self) -> Cursor<'_, K, V> {
        Cursor::start(self, LEFT)
    }

    /// Cursor positioned at the largest key.
    pub fn cursor_last(&self) -> Cursor<'_, K, V> {
        Cursor::start(self, RIGHT)
    }

    /// Iterates over the entries in ascending key order. Use `.rev()` for
    /// descending order.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter::new(self)
    }
}

impl<K: Ord, V> RbMap<K, V> {
    fn find(&self, key: &K) -> Link {
        let mut curr = self.root;
        while let Some(node) = curr {
            // SAFETY: every reachable link points at a node owned by this map.
            unsafe {
                curr = match Node::<K, V>::key(node).cmp(key) {
                    Ordering::Equal => return Some(node),
                    Ordering::Less => child(node, RIGHT),
                    Ordering::Greater => child(node, LEFT),
                };
            }
        }
        None
    }

    /// Node holding the greatest key strictly below `key`.
    fn floor_link(&self, key: &K) -> Link {
        let mut best = None;
        let mut curr = self.root;
        while let Some(node) = curr {
            // SAFETY: every reachable link points at a node owned by this map.
            unsafe {
                if Node::<K, V>::key(node) < key {
                    // Anything better lies to the right.
                    best = Some(node);
                    curr = child(node, RIGHT);
                } else {
                    curr = child(node, LEFT);
                }
            }
        }
        best
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        // SAFETY: the node is owned by this map and borrowed with it.
        self.find(key).map(|node| unsafe { Node::<K, V>::value(node) })
    }

    /// Mutable access to a stored value, without reinserting it.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        // SAFETY: the map is mutably borrowed, so this is the only reference.
        self.find(key).map(|node| unsafe { Node::<K, V>::value_mut(node) })
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.find(key).is_some()
    }

    /// Entry with the greatest key strictly less than `key`.
    pub fn floor_exclusive(&self, key: &K) -> Option<(&K, &V)> {
        let node = self.floor_link(key)?;
        // SAFETY: the node is owned by this map and borrowed with it.
        unsafe { Some((Node::<K, V>::key(node), Node::<K, V>::value(node))) }
    }

    /// Same as [`RbMap::floor_exclusive`], with the value mutable.
    pub fn floor_exclusive_mut(&mut self, key: &K) -> Option<(&K, &mut V)> {
        let node = self.floor_link(key)?;
        // SAFETY: the map is mutably borrowed; key and value are disjoint fields.
        unsafe { Some((Node::<K, V>::key(node), Node::<K, V>::value_mut(node))) }
    }

    /// Inserts `key` with `value`.
    ///
    /// Returns `false` and drops the pair if the key is already present.
    pub fn insert(&mut self, key: K, value: V) -> bool {
        if self.contains_key(&key) {
            return false;
        }
        let fresh = Node::alloc(key, value);
        match self.root {
            None => self.root = Some(fresh),
            // SAFETY: `root` and every link below it are owned by this map.
            Some(root) => unsafe { self.insert_below(root, fresh) },
        }
        if let Some(root) = self.root {
            // SAFETY: root is a live node.
            unsafe { set_red(root, false) };
        }
        self.len += 1;
        true
    }

    /// Walks from `root` to the empty slot where `fresh` belongs, repairing
    /// red violations during the descent, and links `fresh` in.
    ///
    /// # Safety
    ///
    /// `root` must be this map's root and `fresh` a detached node whose key is
    /// not in the map.
    unsafe fn insert_below(&mut self, root: NonNull<Header>, fresh: NonNull<Header>) {
        let mut head = Header {
            red: false,
            link: [None, Some(root)],
        };
        let false_root = NonNull::from(&mut head);

        unsafe {
            let key = Node::<K, V>::key(fresh);
            // Great-grandparent, grandparent, parent and iterator.
            let mut t = false_root;
            let mut g: Link = None;
            let mut p = false_root;
            let mut q = Some(root);
            let mut dir = LEFT;
            let mut last = LEFT;

            loop {
                let node = match q {
                    None => {
                        set_child(p, dir, Some(fresh));
                        fresh
                    }
                    Some(node) => {
                        if is_red(child(node, LEFT)) && is_red(child(node, RIGHT)) {
                            // Color flip.
                            set_red(node, true);
                            paint(child(node, LEFT), false);
                            paint(child(node, RIGHT), false);
                        }
                        node
                    }
                };

                if is_red(Some(node)) && is_red(Some(p)) {
                    // A red parent is never the root, so the grandparent exists.
                    if let Some(grand) = g {
                        let dir2 = if child(t, RIGHT) == Some(grand) { RIGHT } else { LEFT };
                        let top = if child(p, last) == Some(node) {
                            rotate_single(grand, opposite(last))
                        } else {
                            rotate_double(grand, opposite(last))
                        };
                        set_child(t, dir2, Some(top));
                    }
                }

                if node == fresh {
                    break;
                }

                last = dir;
                dir = if Node::<K, V>::key(node) < key { RIGHT } else { LEFT };

                if let Some(grand) = g {
                    t = grand;
                }
                g = Some(p);
                p = node;
                q = child(node, dir);
            }
        }

        self.root = head.link[RIGHT];
    }

    /// Removes `key` and returns its value, or `None` if it is not present.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let root = self.root?;
        if !self.contains_key(key) {
            return None;
        }

        let mut head = Header {
            red: false,
            link: [None, Some(root)],
        };
        let false_root = NonNull::from(&mut head);
        let removed;

        // SAFETY: all links reachable from the false root are owned by this
        // map. Rotations relink nodes but never move them, so the window
        // pointers stay valid for the whole descent.
        unsafe {
            let mut g;
            let mut p = false_root;
            let mut q = false_root;
            let mut found: Link = None;
            let mut dir = RIGHT;

            // Push a red node down the search path so the node finally
            // unlinked is red or has a red child.
            while let Some(next) = child(q, dir) {
                let last = dir;
                g = p;
                p = q;
                q = next;

                let ordering = Node::<K, V>::key(q).cmp(key);
                if ordering == Ordering::Equal {
                    found = Some(q);
                }
                // On a match keep going right, towards the in-order successor.
                dir = if ordering == Ordering::Greater { LEFT } else { RIGHT };

                if is_red(Some(q)) || is_red(child(q, dir)) {
                    continue;
                }
                if is_red(child(q, opposite(dir))) {
                    let top = rotate_single(q, dir);
                    set_child(p, last, Some(top));
                    p = top;
                } else if let Some(s) = child(p, opposite(last)) {
                    if !is_red(child(s, LEFT)) && !is_red(child(s, RIGHT)) {
                        // Color flip.
                        set_red(p, false);
                        set_red(s, true);
                        set_red(q, true);
                    } else {
                        let dir2 = if child(g, RIGHT) == Some(p) { RIGHT } else { LEFT };
                        let top = if is_red(child(s, last)) {
                            rotate_double(p, last)
                        } else {
                            rotate_single(p, last)
                        };
                        set_child(g, dir2, Some(top));

                        set_red(q, true);
                        set_red(top, true);
                        paint(child(top, LEFT), false);
                        paint(child(top, RIGHT), false);
                    }
                }
            }

            removed = match found {
                Some(found) => {
                    if found != q {
                        let found = found.cast::<Node<K, V>>().as_ptr();
                        let last = q.cast::<Node<K, V>>().as_ptr();
                        std::ptr::swap(&raw mut (*found).key, &raw mut (*last).key);
                        std::ptr::swap(&raw mut (*found).value, &raw mut (*last).value);
                    }
                    // `q` has at most one child, which takes its place.
                    let orphan = if child(q, LEFT).is_none() {
                        child(q, RIGHT)
                    } else {
                        child(q, LEFT)
                    };
                    let side = if child(p, RIGHT) == Some(q) { RIGHT } else { LEFT };
                    set_child(p, side, orphan);
                    let (_, value) = Node::<K, V>::free(q);
                    Some(value)
                }
                None => None,
            };
        }

        self.root = head.link[RIGHT];
        if let Some(root) = self.root {
            // SAFETY: root is a live node.
            unsafe { set_red(root, false) };
        }
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    /// Checks every red-black invariant and key ordering, returning the black
    /// height. Panics on the first violation.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) -> usize {
        /// Returns the black height of `node`'s subtree.
        fn walk<K: Ord, V>(node: Link, lower: Option<&K>, upper: Option<&K>) -> usize {
            let Some(node) = node else { return 1 };
            unsafe {
                let key = Node::<K, V>::key(node);
                assert!(lower.is_none_or(|lower| lower < key), "keys out of order");
                assert!(upper.is_none_or(|upper| key < upper), "keys out of order");
                let red = is_red(Some(node));
                if red {
                    assert!(!is_red(child(node, LEFT)), "red node with red left child");
                    assert!(!is_red(child(node, RIGHT)), "red node with red right child");
                }
                let left = walk::<K, V>(child(node, LEFT), lower, Some(key));
                let right = walk::<K, V>(child(node, RIGHT), Some(key), upper);
                assert_eq!(left, right, "black height mismatch");
                left + usize::from(!red)
            }
        }

        // SAFETY: root is empty or a live node.
        assert!(!unsafe { is_red(self.root) }, "red root");
        let black_height = walk::<K, V>(self.root, None, None);
        assert_eq!(self.iter().count(), self.len, "length out of sync");
        black_height
    }
}

impl<K, V> Drop for RbMap<K, V> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<K, V> Default for RbMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for RbMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<'a, K, V> IntoIterator for &'a RbMap<K, V> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
