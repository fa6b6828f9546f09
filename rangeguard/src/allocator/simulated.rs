//! Deterministic address-space allocator.
//!
//! Hands out addresses from a pretend heap without backing them with memory.
//! Freed blocks are reused first-fit and coalesced, which reproduces the
//! reuse and fragmentation patterns the tracker has to reconcile.

use super::RawAllocator;
use crate::address::Address;
use std::collections::BTreeMap;
use tracing::warn;

/// Allocation granularity; every block is a non-zero multiple of it.
const GRANULE: usize = 16;

fn block_size(size: usize) -> Option<usize> {
    size.max(1).checked_next_multiple_of(GRANULE)
}

/// A simulated heap growing upwards from a base address.
#[derive(Debug, Clone)]
pub struct SimulatedHeap {
    base: usize,
    /// Bytes between `base` and the untouched part of the heap.
    top: usize,
    capacity: Option<usize>,
    /// Free spans below `top`, start -> length.
    free: BTreeMap<usize, usize>,
    /// Outstanding blocks, start -> length.
    blocks: BTreeMap<usize, usize>,
}

impl SimulatedHeap {
    /// Unbounded heap starting at `base`, rounded up to the granule and never
    /// at the null address.
    pub fn new(base: Address) -> Self {
        let base = base.get().max(GRANULE);
        Self {
            base: base.checked_next_multiple_of(GRANULE).unwrap_or(GRANULE),
            top: 0,
            capacity: None,
            free: BTreeMap::new(),
            blocks: BTreeMap::new(),
        }
    }

    /// Heap that refuses to grow past `capacity` bytes.
    pub fn with_capacity(base: Address, capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::new(base)
        }
    }

    pub fn base(&self) -> Address {
        Address::new(self.base)
    }

    /// Number of outstanding blocks.
    pub fn outstanding(&self) -> usize {
        self.blocks.len()
    }

    /// Bytes currently handed out, including rounding.
    pub fn in_use(&self) -> usize {
        self.blocks.values().sum()
    }

    fn top_address(&self) -> usize {
        self.base + self.top
    }

    fn fits(&self, top: usize) -> bool {
        self.capacity.is_none_or(|capacity| top <= capacity)
    }

    /// Returns a span to the free list, merging it with its neighbours and
    /// with the untouched top of the heap.
    fn give_back(&mut self, mut start: usize, mut len: usize) {
        if let Some(next) = self.free.remove(&(start + len)) {
            len += next;
        }
        if let Some((&prev, &prev_len)) = self.free.range(..start).next_back() {
            if prev + prev_len == start {
                self.free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }
        if start + len == self.top_address() {
            self.top -= len;
        } else {
            self.free.insert(start, len);
        }
    }
}

impl RawAllocator for SimulatedHeap {
    fn allocate(&mut self, size: usize) -> Option<Address> {
        let needed = block_size(size)?;

        let first_fit = self
            .free
            .iter()
            .find(|&(_, &len)| len >= needed)
            .map(|(&start, &len)| (start, len));
        if let Some((start, len)) = first_fit {
            self.free.remove(&start);
            if len > needed {
                self.free.insert(start + needed, len - needed);
            }
            self.blocks.insert(start, needed);
            return Some(Address::new(start));
        }

        let start = self.top_address();
        let top = self.top.checked_add(needed)?;
        if !self.fits(top) || start.checked_add(needed).is_none() {
            return None;
        }
        self.top = top;
        self.blocks.insert(start, needed);
        Some(Address::new(start))
    }

    unsafe fn release(&mut self, address: Address) {
        match self.blocks.remove(&address.get()) {
            Some(len) => self.give_back(address.get(), len),
            None => warn!("Simulated heap asked to release unknown block {}", address),
        }
    }

    unsafe fn resize(&mut self, address: Address, size: usize) -> Option<Address> {
        let start = address.get();
        let current = *self.blocks.get(&start)?;
        let needed = block_size(size)?;

        if needed <= current {
            if needed < current {
                self.blocks.insert(start, needed);
                self.give_back(start + needed, current - needed);
            }
            return Some(address);
        }

        // Grow in place into a free neighbour or the untouched top.
        let extra = needed - current;
        let tail = start + current;
        if let Some(&free_len) = self.free.get(&tail) {
            if free_len >= extra {
                self.free.remove(&tail);
                if free_len > extra {
                    self.free.insert(tail + extra, free_len - extra);
                }
                self.blocks.insert(start, needed);
                return Some(address);
            }
        }
        if tail == self.top_address() {
            if let Some(top) = self.top.checked_add(extra).filter(|&top| self.fits(top)) {
                self.top = top;
                self.blocks.insert(start, needed);
                return Some(address);
            }
        }

        let moved = self.allocate(size)?;
        // SAFETY: `address` is outstanding, checked above.
        unsafe { self.release(address) };
        Some(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Address = Address::new(0x1000);

    #[test]
    fn test_bump_and_reuse() {
        let mut heap = SimulatedHeap::new(BASE);
        let a = heap.allocate(100).unwrap();
        let b = heap.allocate(1).unwrap();
        assert_eq!(a, BASE);
        assert_eq!(b, Address::new(0x1000 + 112));

        unsafe { heap.release(a) };
        // First fit reuses the hole and splits it.
        assert_eq!(heap.allocate(40).unwrap(), BASE);
        assert_eq!(heap.allocate(40).unwrap(), Address::new(0x1000 + 48));
        assert_eq!(heap.outstanding(), 3);
    }

    #[test]
    fn test_coalescing_returns_top() {
        let mut heap = SimulatedHeap::new(BASE);
        let a = heap.allocate(16).unwrap();
        let b = heap.allocate(16).unwrap();
        unsafe {
            heap.release(a);
            heap.release(b);
        }
        assert_eq!(heap.in_use(), 0);
        assert_eq!(heap.allocate(32).unwrap(), BASE);
    }

    #[test]
    fn test_resize_in_place_and_moving() {
        let mut heap = SimulatedHeap::new(BASE);
        let a = heap.allocate(16).unwrap();
        unsafe {
            // At the top: grows in place.
            assert_eq!(heap.resize(a, 64), Some(a));
            let b = heap.allocate(16).unwrap();
            // Boxed in by `b`: must move.
            let moved = heap.resize(a, 128).unwrap();
            assert!(moved > b);
            // Shrinking never moves.
            assert_eq!(heap.resize(moved, 8), Some(moved));
        }
    }

    #[test]
    fn test_capacity_exhaustion() {
        let mut heap = SimulatedHeap::with_capacity(BASE, 64);
        let a = heap.allocate(48).unwrap();
        assert_eq!(heap.allocate(32), None);
        unsafe {
            assert_eq!(heap.resize(a, 128), None);
            // A failed resize leaves the block alone.
            assert_eq!(heap.in_use(), 48);
        }
    }

    #[test]
    fn test_null_base_is_avoided() {
        let mut heap = SimulatedHeap::new(Address::NULL);
        assert!(!heap.allocate(0).unwrap().is_null());
    }
}
