//! Allocators the guard sits in front of.
//!
//! The guard never reads or writes the blocks it tracks; it only forwards
//! requests to a [`RawAllocator`] and records the ranges that come back.

mod simulated;
mod system;

pub use simulated::SimulatedHeap;
pub use system::SystemAllocator;

use crate::address::Address;

/// Source of raw memory blocks.
///
/// Implementations must never return the null address and must never hand
/// out a block overlapping one that is still outstanding.
pub trait RawAllocator {
    /// Returns the start of a fresh block of at least `size` bytes, or `None`
    /// if the request cannot be satisfied.
    fn allocate(&mut self, size: usize) -> Option<Address>;

    /// Returns a block to the allocator.
    ///
    /// # Safety
    ///
    /// `address` must have been returned by this allocator and not released
    /// since.
    unsafe fn release(&mut self, address: Address);

    /// Grows or shrinks a block, moving it if needed. On `None` the original
    /// block is left untouched.
    ///
    /// # Safety
    ///
    /// Same as [`RawAllocator::release`].
    unsafe fn resize(&mut self, address: Address, size: usize) -> Option<Address>;
}
