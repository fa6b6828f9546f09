//! Real memory from the global allocator.

use super::RawAllocator;
use crate::address::Address;
use std::alloc::{self, Layout};

/// Bytes reserved in front of every block to remember its size. Also the
/// alignment of every block handed out.
const HEADER_SIZE: usize = 16;

/// Forwards to [`std::alloc`], prefixing each block with its size so that
/// release and resize can rebuild the original [`Layout`].
///
/// ```text
/// +-------------+
/// |    size     | <- Block returned by the global allocator.
/// +-------------+
/// |   Content   | <- Address handed to the caller.
/// +-------------+
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl SystemAllocator {
    pub fn new() -> Self {
        Self
    }

    fn layout(size: usize) -> Option<Layout> {
        let total = size.checked_add(HEADER_SIZE)?;
        Layout::from_size_align(total, HEADER_SIZE).ok()
    }

    /// Start of the underlying block and the size stored in its header.
    ///
    /// # Safety
    ///
    /// `address` must be an outstanding block from this allocator.
    unsafe fn header_of(address: Address) -> (*mut u8, usize) {
        unsafe {
            let base = address.as_ptr().sub(HEADER_SIZE);
            (base, base.cast::<usize>().read())
        }
    }

    /// # Safety
    ///
    /// `base` must point to at least `HEADER_SIZE` writable bytes.
    unsafe fn finish(base: *mut u8, size: usize) -> Address {
        unsafe {
            base.cast::<usize>().write(size);
            Address::from_ptr(base.add(HEADER_SIZE))
        }
    }
}

impl RawAllocator for SystemAllocator {
    fn allocate(&mut self, size: usize) -> Option<Address> {
        let layout = Self::layout(size)?;
        // SAFETY: the header makes the layout non-zero sized.
        let base = unsafe { alloc::alloc(layout) };
        if base.is_null() {
            return None;
        }
        // SAFETY: the block is at least `HEADER_SIZE` bytes long.
        Some(unsafe { Self::finish(base, size) })
    }

    unsafe fn release(&mut self, address: Address) {
        // SAFETY: the caller passes an outstanding block.
        let (base, size) = unsafe { Self::header_of(address) };
        if let Some(layout) = Self::layout(size) {
            // SAFETY: `base` was allocated with exactly this layout.
            unsafe { alloc::dealloc(base, layout) };
        }
    }

    unsafe fn resize(&mut self, address: Address, size: usize) -> Option<Address> {
        // SAFETY: the caller passes an outstanding block.
        let (base, old_size) = unsafe { Self::header_of(address) };
        let old_layout = Self::layout(old_size)?;
        let new_layout = Self::layout(size)?;
        // SAFETY: `base` was allocated with `old_layout` and the new size was
        // validated by `Layout::from_size_align`.
        let moved = unsafe { alloc::realloc(base, old_layout, new_layout.size()) };
        if moved.is_null() {
            return None;
        }
        // SAFETY: the new block is at least `HEADER_SIZE` bytes long.
        Some(unsafe { Self::finish(moved, size) })
    }
}
